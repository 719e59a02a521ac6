//! The traffic cop: routes SQL text or bound plans through
//! parse / plan / execute and manages the session's transaction bracket.
//!
//! Constructed once at server bootstrap and shared by every session; it
//! owns no session state. A statement arriving outside a transaction block
//! is wrapped in an implicit single-statement transaction; inside a block,
//! execution uses the session's open transaction and any failure aborts it.

use std::sync::Arc;

use tracing::debug;

use crate::catalog::Catalog;
use crate::error::Error;
use crate::executor::{build_executor, ExecutionContext};
use crate::plan::{FieldInfo, Plan, PlanNode};
use crate::planner;
use crate::storage::{Tuple, TupleStore};
use crate::txn::{TransactionManager, TransactionRecord};
use crate::value::Value;

/// A statement plan bound to parameter values, ready to execute.
#[derive(Debug, Clone)]
pub struct BoundPlan {
    pub plan: Arc<Plan>,
    pub params: Vec<Value>,
}

/// Result of executing one statement.
#[derive(Debug)]
pub struct ExecOutcome {
    pub rows: Vec<Tuple>,
    pub row_desc: Vec<FieldInfo>,
    pub rows_affected: u64,
    pub kind: String,
}

impl ExecOutcome {
    fn command(kind: &str, rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            row_desc: Vec::new(),
            rows_affected,
            kind: kind.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct TrafficCop {
    catalog: Arc<Catalog>,
    store: Arc<TupleStore>,
    tm: Arc<TransactionManager>,
}

impl TrafficCop {
    pub fn new(catalog: Arc<Catalog>, store: Arc<TupleStore>, tm: Arc<TransactionManager>) -> Self {
        Self { catalog, store, tm }
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.tm
    }

    /// Simple-query path: parse, plan, and execute one statement.
    pub fn portal_exec(
        &self,
        session_txn: &mut Option<TransactionRecord>,
        sql: &str,
    ) -> Result<ExecOutcome, Error> {
        let plan = self.prepare(sql)?;
        self.execute(session_txn, &plan, &[])
    }

    /// Parse and plan, returning a reusable statement plan.
    pub fn prepare(&self, sql: &str) -> Result<Arc<Plan>, Error> {
        debug!(sql, "prepare");
        Ok(Arc::new(planner::plan(&self.catalog, sql)?))
    }

    /// Output row descriptor of a plan.
    pub fn row_desc(&self, plan: &Plan) -> Vec<FieldInfo> {
        plan.row_desc.clone()
    }

    /// Attach decoded parameter values to a prepared plan.
    pub fn bind(&self, plan: &Arc<Plan>, params: Vec<Value>) -> Result<BoundPlan, Error> {
        if params.len() < plan.param_count {
            return Err(crate::error::PlanError::InvalidParameter(format!(
                "statement requires {} parameters, {} bound",
                plan.param_count,
                params.len()
            ))
            .into());
        }
        Ok(BoundPlan {
            plan: Arc::clone(plan),
            params,
        })
    }

    /// Execute a bound plan under the session's transaction bracket.
    pub fn exec_prepared(
        &self,
        session_txn: &mut Option<TransactionRecord>,
        bound: &BoundPlan,
    ) -> Result<ExecOutcome, Error> {
        self.execute(session_txn, &bound.plan, &bound.params)
    }

    /// Execute a plan with bound parameters under the session's transaction
    /// bracket.
    pub fn execute(
        &self,
        session_txn: &mut Option<TransactionRecord>,
        plan: &Plan,
        params: &[Value],
    ) -> Result<ExecOutcome, Error> {
        match &plan.node {
            PlanNode::Begin => {
                if session_txn.is_none() {
                    *session_txn = Some(self.tm.begin_transaction());
                }
                Ok(ExecOutcome::command(&plan.kind, 0))
            }
            PlanNode::Commit => {
                if let Some(mut txn) = session_txn.take() {
                    self.tm.commit_transaction(&mut txn)?;
                }
                Ok(ExecOutcome::command(&plan.kind, 0))
            }
            PlanNode::Rollback => {
                if let Some(mut txn) = session_txn.take() {
                    self.tm.abort_transaction(&mut txn);
                }
                Ok(ExecOutcome::command(&plan.kind, 0))
            }
            PlanNode::CreateTable { name, schema } => {
                self.catalog.create_table(name, schema.clone())?;
                Ok(ExecOutcome::command(&plan.kind, 0))
            }
            PlanNode::DropTable { name } => {
                self.catalog.drop_table(name)?;
                Ok(ExecOutcome::command(&plan.kind, 0))
            }
            _ => self.execute_dml(session_txn, plan, params),
        }
    }

    /// Abort a session's open transaction (disconnect, failed block).
    pub fn abort(&self, txn: &mut TransactionRecord) {
        self.tm.abort_transaction(txn);
    }

    fn execute_dml(
        &self,
        session_txn: &mut Option<TransactionRecord>,
        plan: &Plan,
        params: &[Value],
    ) -> Result<ExecOutcome, Error> {
        match session_txn.as_mut() {
            None => {
                // Implicit single-statement transaction.
                let mut txn = self.tm.begin_transaction();
                match self.run_plan(&mut txn, plan, params) {
                    Ok(outcome) => {
                        self.tm.commit_transaction(&mut txn)?;
                        Ok(outcome)
                    }
                    Err(err) => {
                        self.tm.abort_transaction(&mut txn);
                        Err(err)
                    }
                }
            }
            Some(txn) => {
                let result = self.run_plan(txn, plan, params);
                if result.is_err() {
                    // The block is failed; abort eagerly. The session keeps
                    // reporting Failed until it sees ROLLBACK.
                    if let Some(mut txn) = session_txn.take() {
                        self.tm.abort_transaction(&mut txn);
                    }
                }
                result
            }
        }
    }

    fn run_plan(
        &self,
        txn: &mut TransactionRecord,
        plan: &Plan,
        params: &[Value],
    ) -> Result<ExecOutcome, Error> {
        let mut executor = build_executor(&plan.node)?;
        let mut ctx = ExecutionContext {
            catalog: &self.catalog,
            store: &self.store,
            tm: &self.tm,
            txn,
            params,
        };
        executor.init(&mut ctx)?;
        let mut rows = Vec::new();
        while let Some(row) = executor.next_tuple(&mut ctx)? {
            rows.push(row);
        }
        executor.close(&mut ctx)?;

        let rows_affected = if plan.row_desc.is_empty() {
            executor.rows_affected()
        } else {
            rows.len() as u64
        };
        Ok(ExecOutcome {
            rows,
            row_desc: plan.row_desc.clone(),
            rows_affected,
            kind: plan.kind.clone(),
        })
    }
}
