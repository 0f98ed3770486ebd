pub mod catalog;
pub mod compiler;
pub mod dag;
pub mod dialect;
pub mod error;
mod lower;
pub mod plan;
pub mod query;
pub mod sql;

// Re-export main types and functions
pub use compiler::{CohortCompiler, POPULATION_COLUMN};
pub use error::CompileError;

// Re-export types explicitly
pub use catalog::{BackendCatalog, ColumnDef, ColumnType, StaticCatalog, TableExpression};
pub use dialect::{Dialect, GenericDialect, MssqlDialect, SparkDialect, TempNamer};
pub use plan::{CohortPlan, PlanStatement, StatementPurpose};
pub use query::{
    categorise,
    codelist,
    date_difference_in_years,
    eq,
    function,
    ge,
    gt,
    le,
    lt,
    ne,
    table,
    AggregateFunction,
    Comparator,
    Connector,
    FilterOp,
    FunctionKind,
    Literal,
    Node,
    NodeId,
    Operand,
    Operator,
    OutputKind,
    QueryNode,
    RowExpr,
    TableExpr,
};
