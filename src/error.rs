//! Error types for matview.
//!
//! All errors that can occur within the engine are represented by [`MatViewError`].
//! Errors are propagated via `Result<T, MatViewError>` up to the enclosing
//! transaction, which is expected to abort and roll back the triggering
//! mutation. Nothing in this crate retries.
//!
//! # Error Classification
//!
//! - **Configuration** — unsupported aggregate kinds, malformed view schemas.
//!   Raised at install time; the view is not installed.
//! - **User** — unknown tables, duplicate attachments, constraint and type
//!   violations on the data path.
//! - **Resource** — temp-table limits hit during plan execution. Propagated
//!   unchanged from the plan layer.
//! - **Internal** — the view is provably out of sync with its sources.

use std::fmt;

use crate::storage::TableId;

/// Primary error type for the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatViewError {
    // ── Configuration errors — view is not installed ─────────────────────
    /// A destination column carries an aggregate kind the merge algebra
    /// does not support.
    #[error("error in materialized view {view} aggregation {agg_index}: unsupported expression type {expression}")]
    UnsupportedAggregate {
        view: String,
        agg_index: usize,
        expression: String,
    },

    /// The view definition does not match its destination schema.
    #[error("invalid view definition for {view}: {reason}")]
    InvalidViewDefinition { view: String, reason: String },

    /// An engine setting is outside of its accepted range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── User errors — precondition violations on the caller's side ───────
    /// The referenced table does not exist in the execution context.
    #[error("table not found: {0}")]
    TableNotFound(TableId),

    /// The referenced view does not exist.
    #[error("view not found: {0}")]
    ViewNotFound(String),

    /// A table or view with the same identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The source table is already attached to the view handler.
    #[error("source table {source_table} is already attached to view {view}")]
    SourceAlreadyAttached { view: String, source_table: TableId },

    /// The source table is not attached to the view handler.
    #[error("source table {source_table} is not attached to view {view}")]
    SourceNotAttached { view: String, source_table: TableId },

    /// An invalid argument was provided to an API function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A unique index rejected a key.
    #[error("constraint violation on {table}: {detail}")]
    ConstraintViolation { table: String, detail: String },

    /// Arithmetic or comparison on incompatible value types.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Integer arithmetic overflowed.
    #[error("numeric overflow: {0}")]
    NumericOverflow(String),

    // ── Resource errors — propagated from plan execution ─────────────────
    /// A plan produced more rows than a temp table may hold.
    #[error("temp table row limit of {limit} exceeded")]
    TempTableLimitExceeded { limit: usize },

    // ── Internal errors — should not happen ──────────────────────────────
    /// The delete path expected an existing view row for the delta's group
    /// key and found none.
    #[error(
        "materialized view handler for table {view} went looking for a tuple in the view and expected to find it but didn't (key {key})"
    )]
    MissingViewRow { view: String, key: String },

    /// A view without group-by columns lost its single row.
    #[error("materialized view {0} has no group-by columns but holds no row")]
    MissingSingletonRow(String),

    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Classification of error severity/kind for callers deciding how to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    User,
    Resource,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "CONFIGURATION"),
            ErrorKind::User => write!(f, "USER"),
            ErrorKind::Resource => write!(f, "RESOURCE"),
            ErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl MatViewError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatViewError::UnsupportedAggregate { .. }
            | MatViewError::InvalidViewDefinition { .. }
            | MatViewError::InvalidConfig(_) => ErrorKind::Configuration,

            MatViewError::TableNotFound(_)
            | MatViewError::ViewNotFound(_)
            | MatViewError::AlreadyExists(_)
            | MatViewError::SourceAlreadyAttached { .. }
            | MatViewError::SourceNotAttached { .. }
            | MatViewError::InvalidArgument(_)
            | MatViewError::ConstraintViolation { .. }
            | MatViewError::TypeMismatch(_)
            | MatViewError::NumericOverflow(_) => ErrorKind::User,

            MatViewError::TempTableLimitExceeded { .. } => ErrorKind::Resource,

            MatViewError::MissingViewRow { .. }
            | MatViewError::MissingSingletonRow(_)
            | MatViewError::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error leaves no valid way to continue with the view.
    ///
    /// Configuration errors reject the install; internal errors mean the
    /// view's one-row-per-group invariant was already broken.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Configuration | ErrorKind::Internal)
    }

    pub(crate) fn invalid_view(view: &str, reason: impl Into<String>) -> Self {
        MatViewError::InvalidViewDefinition {
            view: view.to_string(),
            reason: reason.into(),
        }
    }
}
