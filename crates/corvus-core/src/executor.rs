//! Plan execution.
//!
//! Executors implement a small capability set — `init`, `next_tuple`,
//! `close` — and are dispatched as trait objects over the plan variants.
//! DML executors do their work on the first `next_tuple` call and report
//! through `rows_affected`; Update and Delete snapshot their victim list
//! before mutating so freshly installed versions are never re-visited.

use crate::catalog::{Catalog, TableInfo};
use crate::error::{Error, ExecError};
use crate::plan::{Expr, PlanNode};
use crate::storage::{Tuple, TupleStore};
use crate::txn::{TransactionManager, TransactionRecord};
use crate::types::TupleSlot;
use crate::value::Value;

/// Everything an executor needs for one statement.
pub struct ExecutionContext<'a> {
    pub catalog: &'a Catalog,
    pub store: &'a TupleStore,
    pub tm: &'a TransactionManager,
    pub txn: &'a mut TransactionRecord,
    pub params: &'a [Value],
}

/// The executor capability set.
pub trait Executor {
    fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), Error>;
    fn next_tuple(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Tuple>, Error>;
    fn close(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), Error>;

    /// Rows touched by a DML executor; row-returning executors report 0.
    fn rows_affected(&self) -> u64 {
        0
    }
}

/// Build the executor for a plan node.
pub fn build_executor<'p>(node: &'p PlanNode) -> Result<Box<dyn Executor + 'p>, Error> {
    match node {
        PlanNode::SeqScan {
            table,
            predicate,
            output,
        } => Ok(Box::new(SeqScanExecutor::new(table, predicate, output))),
        PlanNode::Insert {
            table,
            columns,
            rows,
        } => Ok(Box::new(InsertExecutor::new(table, columns, rows))),
        PlanNode::Update {
            table,
            assignments,
            predicate,
        } => Ok(Box::new(UpdateExecutor::new(table, assignments, predicate))),
        PlanNode::Delete { table, predicate } => {
            Ok(Box::new(DeleteExecutor::new(table, predicate)))
        }
        PlanNode::Values { rows } => Ok(Box::new(ValuesExecutor::new(rows))),
        PlanNode::Limit { input, limit } => {
            Ok(Box::new(LimitExecutor::new(build_executor(input)?, *limit)))
        }
        other => Err(crate::error::PlanError::Unsupported(format!(
            "plan node {other:?} is not executable"
        ))
        .into()),
    }
}

/// Scan the visible version of every logical row of a table.
struct SeqScanExecutor<'p> {
    table_name: &'p str,
    predicate: &'p Option<Expr>,
    output: &'p [Expr],
    slots: Vec<TupleSlot>,
    position: usize,
}

impl<'p> SeqScanExecutor<'p> {
    fn new(table_name: &'p str, predicate: &'p Option<Expr>, output: &'p [Expr]) -> Self {
        Self {
            table_name,
            predicate,
            output,
            slots: Vec::new(),
            position: 0,
        }
    }
}

impl Executor for SeqScanExecutor<'_> {
    fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        let table = ctx.catalog.table(self.table_name)?;
        // Snapshot the candidate list up front; each chain is visited once
        // through its head.
        self.slots = ctx
            .store
            .table_slots(&table)
            .into_iter()
            .filter(|slot| ctx.store.is_chain_head(*slot))
            .collect();
        self.position = 0;
        Ok(())
    }

    fn next_tuple(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Tuple>, Error> {
        while self.position < self.slots.len() {
            let slot = self.slots[self.position];
            self.position += 1;

            let Some((_, row)) = ctx.tm.read(ctx.txn, slot)? else {
                continue;
            };
            if let Some(predicate) = self.predicate {
                if !predicate.matches(&row, ctx.params)? {
                    continue;
                }
            }
            let mut projected = Vec::with_capacity(self.output.len());
            for expr in self.output {
                projected.push(expr.eval(&row, ctx.params)?);
            }
            return Ok(Some(projected));
        }
        Ok(None)
    }

    fn close(&mut self, _ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        self.slots.clear();
        Ok(())
    }
}

struct InsertExecutor<'p> {
    table_name: &'p str,
    columns: &'p [usize],
    rows: &'p [Vec<Expr>],
    inserted: u64,
    done: bool,
}

impl<'p> InsertExecutor<'p> {
    fn new(table_name: &'p str, columns: &'p [usize], rows: &'p [Vec<Expr>]) -> Self {
        Self {
            table_name,
            columns,
            rows,
            inserted: 0,
            done: false,
        }
    }
}

impl Executor for InsertExecutor<'_> {
    fn init(&mut self, _ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        self.inserted = 0;
        self.done = false;
        Ok(())
    }

    fn next_tuple(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Tuple>, Error> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let table = ctx.catalog.table(self.table_name)?;
        let schema = &table.schema;
        for exprs in self.rows {
            // Start from all-NULL and fill the targeted columns, cast to
            // the column type.
            let mut row: Tuple = vec![Value::Null; schema.len()];
            for (expr, &column) in exprs.iter().zip(self.columns) {
                let target = schema.column(column).ok_or(ExecError::ColumnCount {
                    expected: schema.len(),
                    actual: column,
                })?;
                row[column] = expr.eval(&[], ctx.params)?.cast(target.value_type)?;
            }
            ctx.tm.insert(ctx.txn, &table, row)?;
            self.inserted += 1;
        }
        Ok(None)
    }

    fn close(&mut self, _ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn rows_affected(&self) -> u64 {
        self.inserted
    }
}

struct UpdateExecutor<'p> {
    table_name: &'p str,
    assignments: &'p [(usize, Expr)],
    predicate: &'p Option<Expr>,
    updated: u64,
    done: bool,
}

impl<'p> UpdateExecutor<'p> {
    fn new(
        table_name: &'p str,
        assignments: &'p [(usize, Expr)],
        predicate: &'p Option<Expr>,
    ) -> Self {
        Self {
            table_name,
            assignments,
            predicate,
            updated: 0,
            done: false,
        }
    }
}

impl Executor for UpdateExecutor<'_> {
    fn init(&mut self, _ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        self.updated = 0;
        self.done = false;
        Ok(())
    }

    fn next_tuple(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Tuple>, Error> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let table = ctx.catalog.table(self.table_name)?;
        let victims = collect_victims(ctx, &table, self.predicate)?;
        for (slot, row) in victims {
            // Every SET expression reads the row as it stood before the
            // statement; assignments never see each other's results.
            let mut updated = row.clone();
            for (column, expr) in self.assignments {
                let target = table.schema.column(*column).ok_or(ExecError::ColumnCount {
                    expected: table.schema.len(),
                    actual: *column,
                })?;
                updated[*column] = expr.eval(&row, ctx.params)?.cast(target.value_type)?;
            }
            ctx.tm.write(ctx.txn, &table, slot, updated)?;
            self.updated += 1;
        }
        Ok(None)
    }

    fn close(&mut self, _ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn rows_affected(&self) -> u64 {
        self.updated
    }
}

struct DeleteExecutor<'p> {
    table_name: &'p str,
    predicate: &'p Option<Expr>,
    deleted: u64,
    done: bool,
}

impl<'p> DeleteExecutor<'p> {
    fn new(table_name: &'p str, predicate: &'p Option<Expr>) -> Self {
        Self {
            table_name,
            predicate,
            deleted: 0,
            done: false,
        }
    }
}

impl Executor for DeleteExecutor<'_> {
    fn init(&mut self, _ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        self.deleted = 0;
        self.done = false;
        Ok(())
    }

    fn next_tuple(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Tuple>, Error> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let table = ctx.catalog.table(self.table_name)?;
        let victims = collect_victims(ctx, &table, self.predicate)?;
        for (slot, _row) in victims {
            ctx.tm.delete(ctx.txn, &table, slot)?;
            self.deleted += 1;
        }
        Ok(None)
    }

    fn close(&mut self, _ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn rows_affected(&self) -> u64 {
        self.deleted
    }
}

/// Visible rows matching `predicate`, with the version slot a write must
/// target. Fully materialized before any mutation.
fn collect_victims(
    ctx: &mut ExecutionContext<'_>,
    table: &TableInfo,
    predicate: &Option<Expr>,
) -> Result<Vec<(TupleSlot, Tuple)>, Error> {
    let heads: Vec<TupleSlot> = ctx
        .store
        .table_slots(table)
        .into_iter()
        .filter(|slot| ctx.store.is_chain_head(*slot))
        .collect();

    let mut victims = Vec::new();
    for head in heads {
        let Some((slot, row)) = ctx.tm.read(ctx.txn, head)? else {
            continue;
        };
        if let Some(predicate) = predicate {
            if !predicate.matches(&row, ctx.params)? {
                continue;
            }
        }
        victims.push((slot, row));
    }
    Ok(victims)
}

struct ValuesExecutor<'p> {
    rows: &'p [Vec<Expr>],
    position: usize,
}

impl<'p> ValuesExecutor<'p> {
    fn new(rows: &'p [Vec<Expr>]) -> Self {
        Self { rows, position: 0 }
    }
}

impl Executor for ValuesExecutor<'_> {
    fn init(&mut self, _ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        self.position = 0;
        Ok(())
    }

    fn next_tuple(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Tuple>, Error> {
        let Some(exprs) = self.rows.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        let mut row = Vec::with_capacity(exprs.len());
        for expr in exprs {
            row.push(expr.eval(&[], ctx.params)?);
        }
        Ok(Some(row))
    }

    fn close(&mut self, _ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        Ok(())
    }
}

struct LimitExecutor<'p> {
    input: Box<dyn Executor + 'p>,
    limit: u64,
    produced: u64,
}

impl<'p> LimitExecutor<'p> {
    fn new(input: Box<dyn Executor + 'p>, limit: u64) -> Self {
        Self {
            input,
            limit,
            produced: 0,
        }
    }
}

impl Executor for LimitExecutor<'_> {
    fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        self.produced = 0;
        self.input.init(ctx)
    }

    fn next_tuple(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Tuple>, Error> {
        if self.produced >= self.limit {
            return Ok(None);
        }
        match self.input.next_tuple(ctx)? {
            Some(row) => {
                self.produced += 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), Error> {
        self.input.close(ctx)
    }

    fn rows_affected(&self) -> u64 {
        self.input.rows_affected()
    }
}
