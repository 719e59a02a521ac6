//! Error types for all CorvusDB engine operations.

use thiserror::Error;

use crate::types::TupleSlot;

/// Top-level error type for engine operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Concurrency-control aborts and transaction lifecycle misuse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxnError {
    #[error("write-write conflict on tuple {0}")]
    WriteWriteConflict(TupleSlot),

    #[error("write validation failed on tuple {0}")]
    WriteValidationFailed(TupleSlot),

    #[error("read validation failed on tuple {0}")]
    ReadValidationFailed(TupleSlot),

    #[error("deadlock detected, transaction {0} aborted")]
    Deadlock(u64),

    #[error("lock wait timeout on tuple {0}")]
    LockTimeout(TupleSlot),

    #[error("operation on transaction in terminal state")]
    TerminalState,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("duplicate column: {0}")]
    DuplicateColumn(String),
}

/// Parse and planning failures. Both surface to the client as a single
/// error response; the session stays open.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("parse error: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    #[error("unsupported statement: {0}")]
    Unsupported(String),

    #[error("expected a single statement, got {0}")]
    MultipleStatements(usize),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("column reference {0} is not allowed here")]
    ColumnNotAllowed(String),

    #[error("unsupported data type: {0}")]
    UnsupportedType(String),

    #[error("INSERT has {given} expressions but {expected} target columns")]
    ColumnCountMismatch { expected: usize, given: usize },

    #[error("invalid parameter reference: {0}")]
    InvalidParameter(String),

    #[error("invalid literal: {0}")]
    InvalidLiteral(String),
}

/// Runtime evaluation failures. Abort the current transaction.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("could not parse '{text}' as {target}")]
    InvalidText { text: String, target: &'static str },

    #[error("malformed binary parameter for type {0}")]
    MalformedBinary(&'static str),

    #[error("division by zero")]
    DivisionByZero,

    #[error("row has {actual} columns, expected {expected}")]
    ColumnCount { expected: usize, actual: usize },

    #[error("parameter ${0} was not bound")]
    MissingParameter(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
