//! Error types for cohort compilation.
//!
//! Every failure the compiler can detect is detected at compile time and is
//! fatal to the run: a [`CompileError`] always names the offending node,
//! table, or column. Errors raised by the database while the caller executes
//! the emitted statements are the caller's to handle; the compiler never
//! opens a connection and never wraps backend errors.

use thiserror::Error;

/// A fatal error raised while compiling a cohort specification to SQL.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The query DAG has an impossible shape, e.g. a chain that does not
    /// match `Table -> Filter* -> Row?`, or a category comparator whose
    /// left-hand side is not a patient-level value.
    #[error("invalid query shape: {0}")]
    Shape(String),

    /// The backend catalog has no table with this name.
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    /// The table exists but does not expose the requested column.
    #[error("column '{column}' not found in table '{table}'")]
    UnknownColumn { table: String, column: String },

    /// A `ValueFromFunction` kind with no registered lowering.
    #[error("unsupported function: {0}")]
    UnsupportedFunction(String),

    /// A codelist that cannot be materialized as a table.
    #[error("invalid codelist: {0}")]
    Codelist(String),

    /// A dialect hook is missing or misconfigured.
    #[error("dialect error: {0}")]
    Dialect(String),
}

impl CompileError {
    pub(crate) fn shape(detail: impl Into<String>) -> Self {
        Self::Shape(detail.into())
    }

    pub(crate) fn unknown_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::UnknownColumn {
            table: table.into(),
            column: column.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offender() {
        let err = CompileError::unknown_column("patients", "heightt");
        assert_eq!(
            err.to_string(),
            "column 'heightt' not found in table 'patients'"
        );

        let err = CompileError::UnknownTable("practise_registrations".into());
        assert_eq!(err.to_string(), "unknown table 'practise_registrations'");
    }
}
