//! Physical plans as tagged variants.
//!
//! There is no plan-node inheritance: each statement shape is one enum
//! variant, and executors dispatch over the variants through a small
//! capability interface (see `executor`).

use crate::catalog::Schema;
use crate::error::ExecError;
use crate::value::{ArithOp, Value, ValueType};

/// A scalar expression evaluated against a row and the bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference by position in the table schema.
    Column(usize),
    Literal(Value),
    /// Placeholder `$n`, zero-based after planning.
    Param(usize),
    Cast {
        expr: Box<Expr>,
        ty: ValueType,
    },
    BinaryOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

impl Expr {
    pub fn eval(&self, row: &[Value], params: &[Value]) -> Result<Value, ExecError> {
        match self {
            Expr::Column(index) => row
                .get(*index)
                .cloned()
                .ok_or(ExecError::ColumnCount {
                    expected: index + 1,
                    actual: row.len(),
                }),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Param(index) => params
                .get(*index)
                .cloned()
                .ok_or(ExecError::MissingParameter(index + 1)),
            Expr::Cast { expr, ty } => expr.eval(row, params)?.cast(*ty),
            Expr::BinaryOp { op, left, right } => {
                let lhs = left.eval(row, params)?;
                let rhs = right.eval(row, params)?;
                eval_binary(*op, lhs, rhs)
            }
            Expr::IsNull { expr, negated } => {
                let value = expr.eval(row, params)?;
                Ok(Value::Boolean(value.is_null() != *negated))
            }
        }
    }

    /// True when the expression evaluates to boolean TRUE (NULL is false).
    pub fn matches(&self, row: &[Value], params: &[Value]) -> Result<bool, ExecError> {
        Ok(matches!(self.eval(row, params)?, Value::Boolean(true)))
    }

    /// Number of parameters this expression requires.
    pub fn param_count(&self) -> usize {
        match self {
            Expr::Column(_) | Expr::Literal(_) => 0,
            Expr::Param(index) => index + 1,
            Expr::Cast { expr, .. } | Expr::IsNull { expr, .. } => expr.param_count(),
            Expr::BinaryOp { left, right, .. } => left.param_count().max(right.param_count()),
        }
    }
}

fn eval_binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, ExecError> {
    match op {
        BinOp::And | BinOp::Or => {
            let to_bool = |v: &Value| match v {
                Value::Boolean(b) => Ok(Some(*b)),
                Value::Null => Ok(None),
                other => Err(ExecError::TypeMismatch {
                    expected: "boolean",
                    actual: match other {
                        Value::Integer(_) => "integer",
                        Value::Double(_) => "double",
                        Value::Varchar(_) => "varchar",
                        _ => "null",
                    },
                }),
            };
            let (l, r) = (to_bool(&lhs)?, to_bool(&rhs)?);
            // Three-valued logic.
            let result = match (op, l, r) {
                (BinOp::And, Some(false), _) | (BinOp::And, _, Some(false)) => Some(false),
                (BinOp::And, Some(true), Some(true)) => Some(true),
                (BinOp::Or, Some(true), _) | (BinOp::Or, _, Some(true)) => Some(true),
                (BinOp::Or, Some(false), Some(false)) => Some(false),
                _ => None,
            };
            Ok(result.map(Value::Boolean).unwrap_or(Value::Null))
        }
        BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
            match lhs.compare(&rhs)? {
                None => Ok(Value::Null),
                Some(ordering) => {
                    let truth = match op {
                        BinOp::Eq => ordering.is_eq(),
                        BinOp::NotEq => !ordering.is_eq(),
                        BinOp::Lt => ordering.is_lt(),
                        BinOp::LtEq => ordering.is_le(),
                        BinOp::Gt => ordering.is_gt(),
                        BinOp::GtEq => ordering.is_ge(),
                        _ => unreachable!("comparison operator"),
                    };
                    Ok(Value::Boolean(truth))
                }
            }
        }
        BinOp::Add => lhs.arithmetic(&rhs, ArithOp::Add),
        BinOp::Sub => lhs.arithmetic(&rhs, ArithOp::Sub),
        BinOp::Mul => lhs.arithmetic(&rhs, ArithOp::Mul),
        BinOp::Div => lhs.arithmetic(&rhs, ArithOp::Div),
    }
}

/// One output column of a row-returning plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub type_oid: i32,
    pub type_size: i16,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            type_oid: ty.type_oid(),
            type_size: ty.type_size(),
        }
    }
}

/// The plan variants.
#[derive(Debug, Clone)]
pub enum PlanNode {
    SeqScan {
        table: String,
        predicate: Option<Expr>,
        output: Vec<Expr>,
    },
    Insert {
        table: String,
        /// Target column indexes, in VALUES order.
        columns: Vec<usize>,
        rows: Vec<Vec<Expr>>,
    },
    Update {
        table: String,
        assignments: Vec<(usize, Expr)>,
        predicate: Option<Expr>,
    },
    Delete {
        table: String,
        predicate: Option<Expr>,
    },
    /// Row source without a table (e.g. `SELECT $1::int`).
    Values {
        rows: Vec<Vec<Expr>>,
    },
    Limit {
        input: Box<PlanNode>,
        limit: u64,
    },
    CreateTable {
        name: String,
        schema: Schema,
    },
    DropTable {
        name: String,
    },
    Begin,
    Commit,
    Rollback,
}

/// A planned statement: the node plus everything the wire layer needs.
#[derive(Debug, Clone)]
pub struct Plan {
    pub node: PlanNode,
    /// Uppercased first token of the statement; drives command tags.
    pub kind: String,
    pub row_desc: Vec<FieldInfo>,
    pub param_count: usize,
}
