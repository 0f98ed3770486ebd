//! The query algebra: an immutable DAG of query nodes describing how each
//! output column is derived from the backend's clinical-data tables.
//!
//! Nodes are built once by the caller (typically through the builder
//! functions in this module) and never mutated by the compiler. Identity
//! within a DAG is by address, not by structure: two structurally equal
//! nodes created separately are distinct, and shared sub-expressions must be
//! shared by construction. [`Node`] is an `Arc` so that sharing a
//! sub-expression is a cheap clone, and [`NodeId`] captures the address for
//! use as a map key.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A shared, immutable query node.
pub type Node = Arc<QueryNode>;

/// The address-based identity of a [`Node`].
///
/// Two `Node` clones of the same `Arc` have the same id; structurally equal
/// nodes built separately do not. The DAG analyzer keys output groups and
/// visited sets on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn of(node: &Node) -> Self {
        NodeId(Arc::as_ptr(node) as usize)
    }
}

/// A literal value appearing in filters, comparators, or function arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
}

impl From<bool> for Literal {
    fn from(v: bool) -> Self {
        Literal::Bool(v)
    }
}

impl From<i64> for Literal {
    fn from(v: i64) -> Self {
        Literal::Integer(v)
    }
}

impl From<i32> for Literal {
    fn from(v: i32) -> Self {
        Literal::Integer(v as i64)
    }
}

impl From<f64> for Literal {
    fn from(v: f64) -> Self {
        Literal::Float(v)
    }
}

impl From<&str> for Literal {
    fn from(v: &str) -> Self {
        Literal::String(v.to_string())
    }
}

impl From<String> for Literal {
    fn from(v: String) -> Self {
        Literal::String(v)
    }
}

impl From<NaiveDate> for Literal {
    fn from(v: NaiveDate) -> Self {
        Literal::Date(v)
    }
}

/// Normalized comparison predicates used by filters and comparators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEquals,
    GreaterThan,
    GreaterThanOrEquals,
    In,
    NotIn,
}

impl Operator {
    /// Short name used in error messages and structural fingerprints.
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Equals => "eq",
            Operator::NotEquals => "ne",
            Operator::LessThan => "lt",
            Operator::LessThanOrEquals => "le",
            Operator::GreaterThan => "gt",
            Operator::GreaterThanOrEquals => "ge",
            Operator::In => "in",
            Operator::NotIn => "not_in",
        }
    }
}

/// Surface filter operators accepted by the builder DSL.
///
/// These are the vocabulary a study definition is written in; each one
/// normalizes to an [`Operator`]. Date-flavoured aliases (`OnOrBefore`,
/// `OnOrAfter`) exist so filters on dates read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEquals,
    GreaterThan,
    GreaterThanOrEquals,
    OnOrBefore,
    OnOrAfter,
    IsIn,
    NotIn,
}

impl FilterOp {
    pub fn normalize(&self) -> Operator {
        match self {
            FilterOp::Equals => Operator::Equals,
            FilterOp::NotEquals => Operator::NotEquals,
            FilterOp::LessThan => Operator::LessThan,
            FilterOp::LessThanOrEquals | FilterOp::OnOrBefore => Operator::LessThanOrEquals,
            FilterOp::GreaterThan => Operator::GreaterThan,
            FilterOp::GreaterThanOrEquals | FilterOp::OnOrAfter => Operator::GreaterThanOrEquals,
            FilterOp::IsIn => Operator::In,
            FilterOp::NotIn => Operator::NotIn,
        }
    }
}

/// Either a literal or a reference to another node.
///
/// Filter values, comparator right-hand sides, and function arguments all
/// accept both forms.
#[derive(Debug, Clone)]
pub enum Operand {
    Literal(Literal),
    Node(Node),
}

impl<T: Into<Literal>> From<T> for Operand {
    fn from(v: T) -> Self {
        Operand::Literal(v.into())
    }
}

impl From<Node> for Operand {
    fn from(node: Node) -> Self {
        Operand::Node(node)
    }
}

impl From<&Node> for Operand {
    fn from(node: &Node) -> Self {
        Operand::Node(Arc::clone(node))
    }
}

/// Per-patient aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Exists,
    Count,
    Sum,
    Min,
    Max,
}

impl AggregateFunction {
    /// The suffix used when naming the aggregate's output column.
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Exists => "exists",
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }

    /// The SQL aggregate invoked for non-`exists` functions.
    pub fn sql_function(&self) -> &'static str {
        match self {
            AggregateFunction::Exists => "EXISTS",
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// N-ary function kinds with registered lowerings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    /// Completed calendar years between a start and end date.
    DateDifferenceInYears,
    /// The first day of the date's month.
    RoundToFirstOfMonth,
    /// The first day of the date's year.
    RoundToFirstOfYear,
}

impl FunctionKind {
    pub fn name(&self) -> &'static str {
        match self {
            FunctionKind::DateDifferenceInYears => "date_difference_in_years",
            FunctionKind::RoundToFirstOfMonth => "round_to_first_of_month",
            FunctionKind::RoundToFirstOfYear => "round_to_first_of_year",
        }
    }
}

/// How two sub-comparators are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

/// A Boolean expression tree over patient-level values.
///
/// Leaves compare a value node against a literal or another value; interior
/// nodes combine two sub-comparators with AND/OR. Any node may be negated.
#[derive(Debug, Clone)]
pub enum Comparator {
    Compare {
        lhs: Node,
        operator: Operator,
        rhs: Operand,
        negated: bool,
    },
    Combine {
        connector: Connector,
        lhs: Box<Comparator>,
        rhs: Box<Comparator>,
        negated: bool,
    },
}

impl Comparator {
    pub fn and(self, other: Comparator) -> Comparator {
        Comparator::Combine {
            connector: Connector::And,
            lhs: Box::new(self),
            rhs: Box::new(other),
            negated: false,
        }
    }

    pub fn or(self, other: Comparator) -> Comparator {
        Comparator::Combine {
            connector: Connector::Or,
            lhs: Box::new(self),
            rhs: Box::new(other),
            negated: false,
        }
    }

    pub fn negate(self) -> Comparator {
        match self {
            Comparator::Compare {
                lhs,
                operator,
                rhs,
                negated,
            } => Comparator::Compare {
                lhs,
                operator,
                rhs,
                negated: !negated,
            },
            Comparator::Combine {
                connector,
                lhs,
                rhs,
                negated,
            } => Comparator::Combine {
                connector,
                lhs,
                rhs,
                negated: !negated,
            },
        }
    }
}

fn compare(lhs: &Node, operator: Operator, rhs: impl Into<Operand>) -> Comparator {
    Comparator::Compare {
        lhs: Arc::clone(lhs),
        operator,
        rhs: rhs.into(),
        negated: false,
    }
}

/// `lhs = rhs`
pub fn eq(lhs: &Node, rhs: impl Into<Operand>) -> Comparator {
    compare(lhs, Operator::Equals, rhs)
}

/// `lhs <> rhs`
pub fn ne(lhs: &Node, rhs: impl Into<Operand>) -> Comparator {
    compare(lhs, Operator::NotEquals, rhs)
}

/// `lhs < rhs`
pub fn lt(lhs: &Node, rhs: impl Into<Operand>) -> Comparator {
    compare(lhs, Operator::LessThan, rhs)
}

/// `lhs <= rhs`
pub fn le(lhs: &Node, rhs: impl Into<Operand>) -> Comparator {
    compare(lhs, Operator::LessThanOrEquals, rhs)
}

/// `lhs > rhs`
pub fn gt(lhs: &Node, rhs: impl Into<Operand>) -> Comparator {
    compare(lhs, Operator::GreaterThan, rhs)
}

/// `lhs >= rhs`
pub fn ge(lhs: &Node, rhs: impl Into<Operand>) -> Comparator {
    compare(lhs, Operator::GreaterThanOrEquals, rhs)
}

/// A named logical table in the backend catalog. Root of every chain.
#[derive(Debug)]
pub struct Table {
    pub name: String,
}

/// A filter applied to a table or to another filter.
#[derive(Debug)]
pub struct FilteredTable {
    pub source: Node,
    pub column: String,
    pub operator: Operator,
    pub value: Operand,
    /// When true, rows where the filtered column IS NULL also match.
    pub or_null: bool,
}

/// Reduces a (possibly filtered) table to one row per patient by ordering on
/// `sort_columns` and picking the first row. Ties are broken by DB-level
/// ordering.
#[derive(Debug)]
pub struct Row {
    pub source: Node,
    pub sort_columns: Vec<String>,
    pub descending: bool,
}

/// A per-patient, possibly-multi-row column drawn from a table with no
/// row-picker applied. Usable as a filter source, never as a declared output.
#[derive(Debug)]
pub struct Column {
    pub source: Node,
    pub column: String,
}

/// A per-patient single value read from a picked row.
#[derive(Debug)]
pub struct ValueFromRow {
    pub source: Node,
    pub column: String,
}

/// A per-patient single value computed by aggregating over a table's rows.
#[derive(Debug)]
pub struct ValueFromAggregate {
    pub source: Node,
    pub function: AggregateFunction,
    pub column: String,
}

/// A per-patient value selected by evaluating comparators in order and
/// yielding the first matching label, else the default.
#[derive(Debug)]
pub struct ValueFromCategory {
    pub definitions: IndexMap<String, Comparator>,
    pub default: Literal,
}

/// An n-ary function over other values and literals.
#[derive(Debug)]
pub struct ValueFromFunction {
    pub kind: FunctionKind,
    pub arguments: Vec<Operand>,
}

/// A finite, system-tagged set of codes, materialized per run as a
/// temporary table with case-sensitive matching.
#[derive(Debug)]
pub struct Codelist {
    pub codes: BTreeSet<String>,
    pub system: String,
}

/// A node in the query DAG.
#[derive(Debug)]
pub enum QueryNode {
    Table(Table),
    FilteredTable(FilteredTable),
    Row(Row),
    Column(Column),
    ValueFromRow(ValueFromRow),
    ValueFromAggregate(ValueFromAggregate),
    ValueFromCategory(ValueFromCategory),
    ValueFromFunction(ValueFromFunction),
    Codelist(Codelist),
}

/// The kind component of an output-group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Column,
    ValueFromRow,
    ValueFromAggregate,
}

impl QueryNode {
    /// True for nodes that represent a patient-level single value.
    pub fn is_value(&self) -> bool {
        matches!(
            self,
            QueryNode::ValueFromRow(_)
                | QueryNode::ValueFromAggregate(_)
                | QueryNode::ValueFromCategory(_)
                | QueryNode::ValueFromFunction(_)
        )
    }

    /// True for nodes whose values are read from an interim table: the
    /// "output nodes" the DAG analyzer groups into per-source queries.
    pub fn output_kind(&self) -> Option<OutputKind> {
        match self {
            QueryNode::Column(_) => Some(OutputKind::Column),
            QueryNode::ValueFromRow(_) => Some(OutputKind::ValueFromRow),
            QueryNode::ValueFromAggregate(_) => Some(OutputKind::ValueFromAggregate),
            _ => None,
        }
    }

    /// The column name an output node contributes to its interim table.
    /// Aggregates combine column and function, e.g. `patient_id_exists`.
    pub fn output_column_name(&self) -> Option<String> {
        match self {
            QueryNode::Column(col) => Some(col.column.clone()),
            QueryNode::ValueFromRow(v) => Some(v.column.clone()),
            QueryNode::ValueFromAggregate(v) => Some(format!("{}_{}", v.column, v.function)),
            _ => None,
        }
    }

    /// The upstream chain node, for nodes that have one.
    pub fn source(&self) -> Option<&Node> {
        match self {
            QueryNode::FilteredTable(f) => Some(&f.source),
            QueryNode::Row(r) => Some(&r.source),
            QueryNode::Column(c) => Some(&c.source),
            QueryNode::ValueFromRow(v) => Some(&v.source),
            QueryNode::ValueFromAggregate(v) => Some(&v.source),
            _ => None,
        }
    }

    /// Short human-readable description used in error messages.
    pub fn describe(&self) -> String {
        match self {
            QueryNode::Table(t) => format!("table '{}'", t.name),
            QueryNode::FilteredTable(f) => {
                format!("filter on column '{}' ({})", f.column, f.operator.name())
            }
            QueryNode::Row(r) => format!("row picker over {:?}", r.sort_columns),
            QueryNode::Column(c) => format!("column '{}'", c.column),
            QueryNode::ValueFromRow(v) => format!("value of column '{}' from picked row", v.column),
            QueryNode::ValueFromAggregate(v) => {
                format!("aggregate {}({})", v.function, v.column)
            }
            QueryNode::ValueFromCategory(_) => "categorised value".to_string(),
            QueryNode::ValueFromFunction(f) => format!("function {}", f.kind.name()),
            QueryNode::Codelist(c) => format!("codelist ({} system)", c.system),
        }
    }
}

/// Starts a chain over the named backend table.
pub fn table(name: impl Into<String>) -> TableExpr {
    TableExpr {
        node: Arc::new(QueryNode::Table(Table { name: name.into() })),
    }
}

/// Builds a categorised value: definitions are evaluated in the given order
/// and the first matching label wins, else `default`.
pub fn categorise<L, D>(definitions: D, default: impl Into<Literal>) -> Node
where
    L: Into<String>,
    D: IntoIterator<Item = (L, Comparator)>,
{
    let definitions = definitions
        .into_iter()
        .map(|(label, comparator)| (label.into(), comparator))
        .collect();
    Arc::new(QueryNode::ValueFromCategory(ValueFromCategory {
        definitions,
        default: default.into(),
    }))
}

/// Builds an n-ary function value over other values and literals.
pub fn function(kind: FunctionKind, arguments: Vec<Operand>) -> Node {
    Arc::new(QueryNode::ValueFromFunction(ValueFromFunction {
        kind,
        arguments,
    }))
}

/// Completed calendar years between two dates.
pub fn date_difference_in_years(start: impl Into<Operand>, end: impl Into<Operand>) -> Node {
    function(
        FunctionKind::DateDifferenceInYears,
        vec![start.into(), end.into()],
    )
}

/// Builds a codelist over a terminology system.
pub fn codelist<I, S>(codes: I, system: impl Into<String>) -> Node
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Arc::new(QueryNode::Codelist(Codelist {
        codes: codes.into_iter().map(Into::into).collect(),
        system: system.into(),
    }))
}

/// A table-valued expression under construction: a `Table` with zero or more
/// filters applied.
#[derive(Debug, Clone)]
pub struct TableExpr {
    node: Node,
}

impl TableExpr {
    /// The underlying chain node.
    pub fn node(&self) -> Node {
        Arc::clone(&self.node)
    }

    fn chained(&self, column: &str, op: FilterOp, value: Operand, or_null: bool) -> TableExpr {
        TableExpr {
            node: Arc::new(QueryNode::FilteredTable(FilteredTable {
                source: Arc::clone(&self.node),
                column: column.to_string(),
                operator: op.normalize(),
                value,
                or_null,
            })),
        }
    }

    /// Keeps rows where `column <op> value`.
    pub fn filter(&self, column: &str, op: FilterOp, value: impl Into<Operand>) -> TableExpr {
        self.chained(column, op, value.into(), false)
    }

    /// Like [`filter`](Self::filter) but rows where the column IS NULL also
    /// match.
    pub fn filter_or_null(
        &self,
        column: &str,
        op: FilterOp,
        value: impl Into<Operand>,
    ) -> TableExpr {
        self.chained(column, op, value.into(), true)
    }

    /// Inclusive range filter, desugared to `>= start` and `<= end`.
    pub fn filter_between(
        &self,
        column: &str,
        start: impl Into<Operand>,
        end: impl Into<Operand>,
    ) -> TableExpr {
        self.filter(column, FilterOp::OnOrAfter, start)
            .filter(column, FilterOp::OnOrBefore, end)
    }

    /// Keeps rows whose `[start_column, end_column]` range contains `date`
    /// (inclusive). Both bounds are expected to be present.
    pub fn date_in_range(
        &self,
        date: impl Into<Operand>,
        start_column: &str,
        end_column: &str,
    ) -> TableExpr {
        let date = date.into();
        self.filter(start_column, FilterOp::LessThanOrEquals, date.clone())
            .filter(end_column, FilterOp::GreaterThanOrEquals, date)
    }

    /// Picks the first row per patient ordered ascending on `columns`.
    pub fn first_by(&self, columns: &[&str]) -> RowExpr {
        self.pick_row(columns, false)
    }

    /// Picks the first row per patient ordered descending on `columns`.
    pub fn last_by(&self, columns: &[&str]) -> RowExpr {
        self.pick_row(columns, true)
    }

    /// The earliest row per patient, sorted on `columns`, or on `date` when
    /// no columns are given.
    pub fn earliest(&self, columns: &[&str]) -> RowExpr {
        let columns: &[&str] = if columns.is_empty() { &["date"] } else { columns };
        self.first_by(columns)
    }

    /// The latest row per patient, sorted on `columns`, or on `date` when no
    /// columns are given.
    pub fn latest(&self, columns: &[&str]) -> RowExpr {
        let columns: &[&str] = if columns.is_empty() { &["date"] } else { columns };
        self.last_by(columns)
    }

    fn pick_row(&self, columns: &[&str], descending: bool) -> RowExpr {
        assert!(!columns.is_empty(), "row picker requires sort columns");
        RowExpr {
            node: Arc::new(QueryNode::Row(Row {
                source: Arc::clone(&self.node),
                sort_columns: columns.iter().map(|c| c.to_string()).collect(),
                descending,
            })),
        }
    }

    /// An event-level column: zero or more values per patient.
    pub fn get(&self, column: &str) -> Node {
        Arc::new(QueryNode::Column(Column {
            source: Arc::clone(&self.node),
            column: column.to_string(),
        }))
    }

    /// TRUE for each patient with at least one surviving row.
    pub fn exists(&self) -> Node {
        self.aggregate(AggregateFunction::Exists, "patient_id")
    }

    /// Count of surviving rows' `column` values per patient.
    pub fn count(&self, column: &str) -> Node {
        self.aggregate(AggregateFunction::Count, column)
    }

    /// Sum of surviving rows' `column` values per patient.
    pub fn sum(&self, column: &str) -> Node {
        self.aggregate(AggregateFunction::Sum, column)
    }

    /// An arbitrary aggregate over `column`.
    pub fn aggregate(&self, function: AggregateFunction, column: &str) -> Node {
        Arc::new(QueryNode::ValueFromAggregate(ValueFromAggregate {
            source: Arc::clone(&self.node),
            function,
            column: column.to_string(),
        }))
    }
}

/// A one-row-per-patient selection produced by a row picker.
#[derive(Debug, Clone)]
pub struct RowExpr {
    node: Node,
}

impl RowExpr {
    pub fn node(&self) -> Node {
        Arc::clone(&self.node)
    }

    /// A per-patient single value read from the picked row.
    pub fn get(&self, column: &str) -> Node {
        Arc::new(QueryNode::ValueFromRow(ValueFromRow {
            source: Arc::clone(&self.node),
            column: column.to_string(),
        }))
    }
}
