//! Statement planning: sqlparser AST in, tagged plan variants out.
//!
//! The parser is an external collaborator (`sqlparser` with the PostgreSQL
//! dialect); this module binds identifiers against the catalog, converts
//! expressions, and derives the output row descriptor.

use sqlparser::ast::{
    self, BinaryOperator, ColumnDef, DataType, ObjectType, SelectItem, SetExpr, Statement,
    TableFactor, UnaryOperator,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::catalog::{Catalog, Column, Schema};
use crate::error::{Error, PlanError};
use crate::plan::{BinOp, Expr, FieldInfo, Plan, PlanNode};
use crate::value::{Value, ValueType};

/// Uppercased first token of a statement; the skip filter and command
/// tags key off it.
pub fn query_kind(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// Parse and plan one SQL statement.
pub fn plan(catalog: &Catalog, sql: &str) -> Result<Plan, Error> {
    let dialect = PostgreSqlDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(PlanError::Parse)?;
    if statements.len() != 1 {
        return Err(PlanError::MultipleStatements(statements.len()).into());
    }
    let statement = statements.pop().ok_or_else(|| {
        PlanError::Unsupported("empty statement".to_string())
    })?;

    let kind = query_kind(sql);
    let (node, row_desc) = plan_statement(catalog, statement)?;
    let param_count = node_param_count(&node);
    Ok(Plan {
        node,
        kind,
        row_desc,
        param_count,
    })
}

fn plan_statement(
    catalog: &Catalog,
    statement: Statement,
) -> Result<(PlanNode, Vec<FieldInfo>), Error> {
    match statement {
        Statement::Query(query) => plan_query(catalog, *query),

        Statement::Insert {
            table_name,
            columns,
            source,
            ..
        } => plan_insert(catalog, table_name, columns, source),

        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => plan_update(catalog, table, assignments, selection),

        Statement::Delete {
            from, selection, ..
        } => plan_delete(catalog, from, selection),

        Statement::CreateTable { name, columns, .. } => plan_create_table(name, columns),

        Statement::Drop {
            object_type, names, ..
        } => {
            if object_type != ObjectType::Table {
                return Err(
                    PlanError::Unsupported(format!("DROP {object_type}")).into()
                );
            }
            let name = object_name(names.first().ok_or_else(|| {
                PlanError::Unsupported("DROP without a target".to_string())
            })?);
            Ok((PlanNode::DropTable { name }, Vec::new()))
        }

        Statement::StartTransaction { .. } => Ok((PlanNode::Begin, Vec::new())),
        Statement::Commit { .. } => Ok((PlanNode::Commit, Vec::new())),
        Statement::Rollback { .. } => Ok((PlanNode::Rollback, Vec::new())),

        other => Err(PlanError::Unsupported(format!("{other}")).into()),
    }
}

fn plan_query(catalog: &Catalog, query: ast::Query) -> Result<(PlanNode, Vec<FieldInfo>), Error> {
    let limit = match &query.limit {
        None => None,
        Some(expr) => match convert_expr(expr, None)? {
            Expr::Literal(Value::Integer(n)) if n >= 0 => Some(n as u64),
            _ => {
                return Err(
                    PlanError::Unsupported("non-constant LIMIT".to_string()).into()
                )
            }
        },
    };

    let (node, row_desc) = match *query.body {
        SetExpr::Select(select) => plan_select(catalog, *select)?,
        SetExpr::Values(values) => {
            let mut rows = Vec::with_capacity(values.rows.len());
            for row in &values.rows {
                let mut exprs = Vec::with_capacity(row.len());
                for item in row {
                    exprs.push(convert_expr(item, None)?);
                }
                rows.push(exprs);
            }
            let row_desc = rows
                .first()
                .map(|row| {
                    row.iter()
                        .enumerate()
                        .map(|(i, expr)| {
                            FieldInfo::new(format!("column{}", i + 1), infer_type(expr, None))
                        })
                        .collect()
                })
                .unwrap_or_default();
            (PlanNode::Values { rows }, row_desc)
        }
        other => {
            return Err(PlanError::Unsupported(format!("query body {other}")).into())
        }
    };

    match limit {
        Some(limit) => Ok((
            PlanNode::Limit {
                input: Box::new(node),
                limit,
            },
            row_desc,
        )),
        None => Ok((node, row_desc)),
    }
}

fn plan_select(
    catalog: &Catalog,
    select: ast::Select,
) -> Result<(PlanNode, Vec<FieldInfo>), Error> {
    if select.from.is_empty() {
        // SELECT without FROM: a single computed row.
        let mut exprs = Vec::new();
        let mut row_desc = Vec::new();
        for item in &select.projection {
            let (expr, name) = convert_projection_item(item, None)?;
            row_desc.push(FieldInfo::new(name, infer_type(&expr, None)));
            exprs.push(expr);
        }
        return Ok((PlanNode::Values { rows: vec![exprs] }, row_desc));
    }

    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return Err(PlanError::Unsupported("joins".to_string()).into());
    }
    let table_name = match &select.from[0].relation {
        TableFactor::Table { name, .. } => object_name(name),
        other => {
            return Err(PlanError::Unsupported(format!("FROM {other}")).into())
        }
    };
    let table = catalog.table(&table_name)?;
    let schema = &table.schema;

    let mut output = Vec::new();
    let mut row_desc = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => {
                for (index, column) in schema.columns().iter().enumerate() {
                    output.push(Expr::Column(index));
                    row_desc.push(FieldInfo::new(column.name.clone(), column.value_type));
                }
            }
            other => {
                let (expr, name) = convert_projection_item(other, Some(schema))?;
                row_desc.push(FieldInfo::new(name, infer_type(&expr, Some(schema))));
                output.push(expr);
            }
        }
    }

    let predicate = select
        .selection
        .as_ref()
        .map(|expr| convert_expr(expr, Some(schema)))
        .transpose()?;

    Ok((
        PlanNode::SeqScan {
            table: table_name,
            predicate,
            output,
        },
        row_desc,
    ))
}

fn plan_insert(
    catalog: &Catalog,
    table_name: ast::ObjectName,
    columns: Vec<ast::Ident>,
    source: Option<Box<ast::Query>>,
) -> Result<(PlanNode, Vec<FieldInfo>), Error> {
    let name = object_name(&table_name);
    let table = catalog.table(&name)?;
    let schema = &table.schema;

    let targets: Vec<usize> = if columns.is_empty() {
        (0..schema.len()).collect()
    } else {
        columns
            .iter()
            .map(|ident| {
                schema
                    .column_index(&ident.value)
                    .ok_or_else(|| PlanError::UnknownColumn(ident.value.clone()))
            })
            .collect::<Result<_, _>>()?
    };

    let query =
        source.ok_or_else(|| PlanError::Unsupported("INSERT without VALUES".to_string()))?;
    let rows = match &*query.body {
        SetExpr::Values(values) => {
            let mut rows = Vec::with_capacity(values.rows.len());
            for row in &values.rows {
                if row.len() != targets.len() {
                    return Err(PlanError::ColumnCountMismatch {
                        expected: targets.len(),
                        given: row.len(),
                    }
                    .into());
                }
                let mut exprs = Vec::with_capacity(row.len());
                for item in row {
                    exprs.push(convert_expr(item, None)?);
                }
                rows.push(exprs);
            }
            rows
        }
        _ => {
            return Err(
                PlanError::Unsupported("INSERT supports VALUES only".to_string()).into()
            )
        }
    };

    Ok((
        PlanNode::Insert {
            table: name,
            columns: targets,
            rows,
        },
        Vec::new(),
    ))
}

fn plan_update(
    catalog: &Catalog,
    table: ast::TableWithJoins,
    assignments: Vec<ast::Assignment>,
    selection: Option<ast::Expr>,
) -> Result<(PlanNode, Vec<FieldInfo>), Error> {
    let table_name = match &table.relation {
        TableFactor::Table { name, .. } => object_name(name),
        other => {
            return Err(PlanError::Unsupported(format!("UPDATE {other}")).into())
        }
    };
    let info = catalog.table(&table_name)?;
    let schema = &info.schema;

    let mut converted = Vec::with_capacity(assignments.len());
    for assignment in &assignments {
        let column = assignment
            .id
            .last()
            .ok_or_else(|| PlanError::Unsupported("empty assignment target".to_string()))?;
        let index = schema
            .column_index(&column.value)
            .ok_or_else(|| PlanError::UnknownColumn(column.value.clone()))?;
        converted.push((index, convert_expr(&assignment.value, Some(schema))?));
    }

    let predicate = selection
        .as_ref()
        .map(|expr| convert_expr(expr, Some(schema)))
        .transpose()?;

    Ok((
        PlanNode::Update {
            table: table_name,
            assignments: converted,
            predicate,
        },
        Vec::new(),
    ))
}

fn plan_delete(
    catalog: &Catalog,
    from: Vec<ast::TableWithJoins>,
    selection: Option<ast::Expr>,
) -> Result<(PlanNode, Vec<FieldInfo>), Error> {
    if from.len() != 1 {
        return Err(PlanError::Unsupported("multi-table DELETE".to_string()).into());
    }
    let table_name = match &from[0].relation {
        TableFactor::Table { name, .. } => object_name(name),
        other => {
            return Err(PlanError::Unsupported(format!("DELETE {other}")).into())
        }
    };
    let info = catalog.table(&table_name)?;

    let predicate = selection
        .as_ref()
        .map(|expr| convert_expr(expr, Some(&info.schema)))
        .transpose()?;

    Ok((
        PlanNode::Delete {
            table: table_name,
            predicate,
        },
        Vec::new(),
    ))
}

fn plan_create_table(
    name: ast::ObjectName,
    columns: Vec<ColumnDef>,
) -> Result<(PlanNode, Vec<FieldInfo>), Error> {
    let mut defs = Vec::with_capacity(columns.len());
    for column in &columns {
        defs.push(Column {
            name: column.name.value.clone(),
            value_type: convert_data_type(&column.data_type)?,
        });
    }
    Ok((
        PlanNode::CreateTable {
            name: object_name(&name),
            schema: Schema::new(defs),
        },
        Vec::new(),
    ))
}

fn object_name(name: &ast::ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

fn convert_data_type(data_type: &DataType) -> Result<ValueType, PlanError> {
    match data_type {
        DataType::Int(_) | DataType::Integer(_) | DataType::SmallInt(_) | DataType::BigInt(_) => {
            Ok(ValueType::Integer)
        }
        DataType::Text | DataType::Varchar(_) | DataType::Char(_) => Ok(ValueType::Varchar),
        DataType::Boolean => Ok(ValueType::Boolean),
        DataType::Double | DataType::DoublePrecision | DataType::Float(_) | DataType::Real => {
            Ok(ValueType::Double)
        }
        other => Err(PlanError::UnsupportedType(format!("{other}"))),
    }
}

/// Convert one projection item, returning the expression and its column name.
fn convert_projection_item(
    item: &SelectItem,
    schema: Option<&Schema>,
) -> Result<(Expr, String), Error> {
    match item {
        SelectItem::UnnamedExpr(expr) => {
            let name = match expr {
                ast::Expr::Identifier(ident) => ident.value.clone(),
                ast::Expr::CompoundIdentifier(parts) => parts
                    .last()
                    .map(|ident| ident.value.clone())
                    .unwrap_or_else(|| "?column?".to_string()),
                _ => "?column?".to_string(),
            };
            Ok((convert_expr(expr, schema)?, name))
        }
        SelectItem::ExprWithAlias { expr, alias } => {
            Ok((convert_expr(expr, schema)?, alias.value.clone()))
        }
        other => Err(PlanError::Unsupported(format!("projection {other}")).into()),
    }
}

/// Convert a scalar expression. `schema = None` forbids column references
/// (VALUES rows, parameters-only contexts).
fn convert_expr(expr: &ast::Expr, schema: Option<&Schema>) -> Result<Expr, Error> {
    match expr {
        ast::Expr::Identifier(ident) => column_ref(&ident.value, schema),
        ast::Expr::CompoundIdentifier(parts) => {
            let ident = parts
                .last()
                .ok_or_else(|| PlanError::Unsupported("empty identifier".to_string()))?;
            column_ref(&ident.value, schema)
        }
        ast::Expr::Value(value) => convert_value(value),
        ast::Expr::Nested(inner) => convert_expr(inner, schema),
        ast::Expr::UnaryOp {
            op: UnaryOperator::Plus,
            expr,
        } => convert_expr(expr, schema),
        ast::Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match convert_expr(expr, schema)? {
            Expr::Literal(Value::Integer(n)) => Ok(Expr::Literal(Value::Integer(-n))),
            Expr::Literal(Value::Double(f)) => Ok(Expr::Literal(Value::Double(-f))),
            other => Ok(Expr::BinaryOp {
                op: BinOp::Sub,
                left: Box::new(Expr::Literal(Value::Integer(0))),
                right: Box::new(other),
            }),
        },
        ast::Expr::Cast {
            expr, data_type, ..
        } => Ok(Expr::Cast {
            expr: Box::new(convert_expr(expr, schema)?),
            ty: convert_data_type(data_type)?,
        }),
        ast::Expr::IsNull(inner) => Ok(Expr::IsNull {
            expr: Box::new(convert_expr(inner, schema)?),
            negated: false,
        }),
        ast::Expr::IsNotNull(inner) => Ok(Expr::IsNull {
            expr: Box::new(convert_expr(inner, schema)?),
            negated: true,
        }),
        ast::Expr::BinaryOp { left, op, right } => {
            let op = convert_operator(op)?;
            Ok(Expr::BinaryOp {
                op,
                left: Box::new(convert_expr(left, schema)?),
                right: Box::new(convert_expr(right, schema)?),
            })
        }
        other => Err(PlanError::Unsupported(format!("expression {other}")).into()),
    }
}

fn column_ref(name: &str, schema: Option<&Schema>) -> Result<Expr, Error> {
    let schema =
        schema.ok_or_else(|| PlanError::ColumnNotAllowed(name.to_string()))?;
    schema
        .column_index(name)
        .map(Expr::Column)
        .ok_or_else(|| PlanError::UnknownColumn(name.to_string()).into())
}

fn convert_value(value: &ast::Value) -> Result<Expr, Error> {
    match value {
        ast::Value::Number(text, _) => {
            if text.contains('.') || text.contains('e') || text.contains('E') {
                text.parse::<f64>()
                    .map(|f| Expr::Literal(Value::Double(f)))
                    .map_err(|_| PlanError::InvalidLiteral(text.clone()).into())
            } else if let Ok(n) = text.parse::<i32>() {
                Ok(Expr::Literal(Value::Integer(n)))
            } else {
                text.parse::<f64>()
                    .map(|f| Expr::Literal(Value::Double(f)))
                    .map_err(|_| PlanError::InvalidLiteral(text.clone()).into())
            }
        }
        ast::Value::SingleQuotedString(text) => {
            Ok(Expr::Literal(Value::Varchar(text.clone())))
        }
        ast::Value::Boolean(b) => Ok(Expr::Literal(Value::Boolean(*b))),
        ast::Value::Null => Ok(Expr::Literal(Value::Null)),
        ast::Value::Placeholder(text) => {
            let index: usize = text
                .strip_prefix('$')
                .and_then(|digits| digits.parse().ok())
                .filter(|n| *n >= 1)
                .ok_or_else(|| PlanError::InvalidParameter(text.clone()))?;
            Ok(Expr::Param(index - 1))
        }
        other => Err(PlanError::InvalidLiteral(format!("{other}")).into()),
    }
}

fn convert_operator(op: &BinaryOperator) -> Result<BinOp, PlanError> {
    match op {
        BinaryOperator::Eq => Ok(BinOp::Eq),
        BinaryOperator::NotEq => Ok(BinOp::NotEq),
        BinaryOperator::Lt => Ok(BinOp::Lt),
        BinaryOperator::LtEq => Ok(BinOp::LtEq),
        BinaryOperator::Gt => Ok(BinOp::Gt),
        BinaryOperator::GtEq => Ok(BinOp::GtEq),
        BinaryOperator::And => Ok(BinOp::And),
        BinaryOperator::Or => Ok(BinOp::Or),
        BinaryOperator::Plus => Ok(BinOp::Add),
        BinaryOperator::Minus => Ok(BinOp::Sub),
        BinaryOperator::Multiply => Ok(BinOp::Mul),
        BinaryOperator::Divide => Ok(BinOp::Div),
        other => Err(PlanError::Unsupported(format!("operator {other}"))),
    }
}

/// Result column type, best-effort.
fn infer_type(expr: &Expr, schema: Option<&Schema>) -> ValueType {
    match expr {
        Expr::Column(index) => schema
            .and_then(|s| s.column(*index))
            .map(|c| c.value_type)
            .unwrap_or(ValueType::Varchar),
        Expr::Literal(value) => value.value_type().unwrap_or(ValueType::Varchar),
        Expr::Param(_) => ValueType::Varchar,
        Expr::Cast { ty, .. } => *ty,
        Expr::IsNull { .. } => ValueType::Boolean,
        Expr::BinaryOp { op, left, right } => match op {
            BinOp::Eq
            | BinOp::NotEq
            | BinOp::Lt
            | BinOp::LtEq
            | BinOp::Gt
            | BinOp::GtEq
            | BinOp::And
            | BinOp::Or => ValueType::Boolean,
            _ => {
                let lhs = infer_type(left, schema);
                let rhs = infer_type(right, schema);
                if lhs == ValueType::Double || rhs == ValueType::Double {
                    ValueType::Double
                } else {
                    ValueType::Integer
                }
            }
        },
    }
}

fn node_param_count(node: &PlanNode) -> usize {
    fn exprs_max(exprs: &[Expr]) -> usize {
        exprs.iter().map(Expr::param_count).max().unwrap_or(0)
    }
    match node {
        PlanNode::SeqScan {
            predicate, output, ..
        } => exprs_max(output).max(predicate.as_ref().map(Expr::param_count).unwrap_or(0)),
        PlanNode::Insert { rows, .. } | PlanNode::Values { rows } => {
            rows.iter().map(|row| exprs_max(row)).max().unwrap_or(0)
        }
        PlanNode::Update {
            assignments,
            predicate,
            ..
        } => assignments
            .iter()
            .map(|(_, expr)| expr.param_count())
            .max()
            .unwrap_or(0)
            .max(predicate.as_ref().map(Expr::param_count).unwrap_or(0)),
        PlanNode::Delete { predicate, .. } => {
            predicate.as_ref().map(Expr::param_count).unwrap_or(0)
        }
        PlanNode::Limit { input, .. } => node_param_count(input),
        PlanNode::CreateTable { .. }
        | PlanNode::DropTable { .. }
        | PlanNode::Begin
        | PlanNode::Commit
        | PlanNode::Rollback => 0,
    }
}
