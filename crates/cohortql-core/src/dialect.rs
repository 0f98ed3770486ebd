//! Dialect adapters: the handful of places where emitted SQL genuinely
//! differs per backend.
//!
//! A [`Dialect`] customizes temporary-table naming, the CREATE-TABLE-AS-
//! SELECT form, the canonical type map, codelist insert batching and
//! collation, boolean rendering, date-function lowering, and post-run
//! cleanup. Everything else in the compiler is dialect-neutral. Date
//! functions are strategy hooks returning expression trees, so a dialect
//! without a matching builtin supplies an equivalent expression instead.

use chrono::Utc;
use rand::Rng;

use crate::catalog::ColumnType;
use crate::sql::{BinaryOp, RenderOptions, SqlExpr};

/// Generates per-run temporary table names of the form
/// `tmp_<YYYYMMDD>_<12 hex chars>_<hint>`.
///
/// One namer is created per compilation run; the random component keeps
/// concurrent runs from colliding, and the date component makes abandoned
/// tables easy to clean up by hand later.
#[derive(Debug, Clone)]
pub struct TempNamer {
    prefix: String,
}

impl TempNamer {
    pub fn new() -> Self {
        let random: u64 = rand::thread_rng().gen::<u64>() & 0xFFFF_FFFF_FFFF;
        TempNamer {
            prefix: format!("tmp_{}_{:012x}_", Utc::now().format("%Y%m%d"), random),
        }
    }

    /// A namer with a fixed prefix, for reproducible output.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        TempNamer {
            prefix: prefix.into(),
        }
    }

    pub fn name(&self, hint: &str) -> String {
        format!("{}{}", self.prefix, hint)
    }
}

impl Default for TempNamer {
    fn default() -> Self {
        Self::new()
    }
}

/// What a per-run table holds, which determines how it is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempTableKind {
    Codelist,
    OutputGroup,
}

/// A table created during the run, recorded for cleanup.
#[derive(Debug, Clone)]
pub struct TempTable {
    pub name: String,
    pub kind: TempTableKind,
}

/// The per-backend customization points.
pub trait Dialect {
    fn name(&self) -> &'static str;

    /// A globally unique per-run name for an intermediate table.
    fn temp_table_name(&self, hint: &str) -> String;

    /// The dialect's CREATE-TABLE-AS-SELECT form.
    fn write_query_to_table(&self, table: &str, query_sql: &str) -> String;

    /// Maps a canonical column type to the dialect's SQL type name.
    fn sql_type(&self, column_type: ColumnType) -> &'static str {
        default_sql_type(column_type)
    }

    /// Upper bound on rows per INSERT when populating codelist tables.
    fn max_rows_per_insert(&self) -> Option<usize> {
        None
    }

    /// Collation applied to the codelist `code` column. Coding systems are
    /// case-sensitive, so every dialect applies a binary collation; override
    /// to substitute the backend's preferred case-sensitive one.
    fn codelist_collation(&self) -> Option<&'static str> {
        Some("Latin1_General_BIN")
    }

    fn render_options(&self) -> RenderOptions {
        RenderOptions::default()
    }

    /// Statements to drop per-run objects, for session-scoped dialects.
    fn cleanup_statements(&self, _tables: &[TempTable]) -> Vec<String> {
        Vec::new()
    }

    /// Completed calendar years between two dates. The canonical lowering
    /// counts year boundaries and subtracts one when the anniversary has
    /// not yet been reached:
    ///
    /// ```sql
    /// CASE WHEN DATEADD(YEAR, DATEDIFF(YEAR, start, end), start) > end
    ///      THEN DATEDIFF(YEAR, start, end) - 1
    ///      ELSE DATEDIFF(YEAR, start, end) END
    /// ```
    fn date_difference_in_years(&self, start: SqlExpr, end: SqlExpr) -> SqlExpr {
        let year_diff = SqlExpr::func(
            "DATEDIFF",
            vec![SqlExpr::Keyword("YEAR"), start.clone(), end.clone()],
        );
        let start_plus_diff = SqlExpr::func(
            "DATEADD",
            vec![SqlExpr::Keyword("YEAR"), year_diff.clone(), start],
        );
        SqlExpr::Case {
            branches: vec![(
                SqlExpr::binary(BinaryOp::Gt, start_plus_diff, end),
                SqlExpr::binary(BinaryOp::Minus, year_diff.clone(), SqlExpr::lit(1)),
            )],
            default: Box::new(year_diff),
        }
    }

    /// The first day of the date's month.
    fn round_to_first_of_month(&self, date: SqlExpr) -> SqlExpr {
        SqlExpr::func(
            "DATEFROMPARTS",
            vec![
                SqlExpr::func("YEAR", vec![date.clone()]),
                SqlExpr::func("MONTH", vec![date]),
                SqlExpr::lit(1),
            ],
        )
    }

    /// The first day of the date's year.
    fn round_to_first_of_year(&self, date: SqlExpr) -> SqlExpr {
        SqlExpr::func(
            "DATEFROMPARTS",
            vec![
                SqlExpr::func("YEAR", vec![date]),
                SqlExpr::lit(1),
                SqlExpr::lit(1),
            ],
        )
    }
}

/// The canonical type map; dialects override entries as needed.
pub fn default_sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Date => "DATE",
        ColumnType::DateTime => "TIMESTAMP",
        ColumnType::Float => "FLOAT",
        ColumnType::Integer => "INTEGER",
        ColumnType::Varchar => "VARCHAR",
        ColumnType::Code => "VARCHAR",
    }
}

/// Plain ANSI-flavoured SQL: `CREATE TABLE .. AS ..`, keyword booleans, no
/// cleanup (temporary objects are the session's problem).
#[derive(Debug)]
pub struct GenericDialect {
    namer: TempNamer,
}

impl GenericDialect {
    pub fn new() -> Self {
        Self::with_namer(TempNamer::new())
    }

    pub fn with_namer(namer: TempNamer) -> Self {
        GenericDialect { namer }
    }
}

impl Default for GenericDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for GenericDialect {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn temp_table_name(&self, hint: &str) -> String {
        self.namer.name(hint)
    }

    fn write_query_to_table(&self, table: &str, query_sql: &str) -> String {
        format!("CREATE TABLE {table} AS {query_sql}")
    }
}

/// Microsoft SQL Server: `SELECT .. INTO ..`, `1`/`0` booleans, binary
/// collation for codes, and a 1000-row cap on multi-row VALUES clauses.
#[derive(Debug)]
pub struct MssqlDialect {
    namer: TempNamer,
}

impl MssqlDialect {
    pub fn new() -> Self {
        Self::with_namer(TempNamer::new())
    }

    pub fn with_namer(namer: TempNamer) -> Self {
        MssqlDialect { namer }
    }
}

impl Default for MssqlDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for MssqlDialect {
    fn name(&self) -> &'static str {
        "mssql"
    }

    fn temp_table_name(&self, hint: &str) -> String {
        self.namer.name(hint)
    }

    fn write_query_to_table(&self, table: &str, query_sql: &str) -> String {
        format!("SELECT * INTO {table} FROM ({query_sql}) AS anon")
    }

    fn sql_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::Boolean => "BIT",
            ColumnType::DateTime => "DATETIME",
            other => default_sql_type(other),
        }
    }

    fn max_rows_per_insert(&self) -> Option<usize> {
        Some(999)
    }

    fn render_options(&self) -> RenderOptions {
        RenderOptions {
            true_literal: "1",
            false_literal: "0",
        }
    }
}

/// Spark SQL: interim results are session-scoped temporary views, dropped
/// explicitly after the run, and date arithmetic goes through
/// `months_between` / `date_trunc`.
#[derive(Debug)]
pub struct SparkDialect {
    namer: TempNamer,
}

impl SparkDialect {
    pub fn new() -> Self {
        Self::with_namer(TempNamer::new())
    }

    pub fn with_namer(namer: TempNamer) -> Self {
        SparkDialect { namer }
    }
}

impl Default for SparkDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for SparkDialect {
    fn name(&self) -> &'static str {
        "spark"
    }

    fn temp_table_name(&self, hint: &str) -> String {
        self.namer.name(hint)
    }

    fn write_query_to_table(&self, table: &str, query_sql: &str) -> String {
        format!("CREATE TEMPORARY VIEW {table} AS {query_sql}")
    }

    fn sql_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::DateTime => "TIMESTAMP",
            other => default_sql_type(other),
        }
    }

    fn cleanup_statements(&self, tables: &[TempTable]) -> Vec<String> {
        tables
            .iter()
            .map(|table| match table.kind {
                TempTableKind::OutputGroup => {
                    format!("DROP VIEW IF EXISTS {}", table.name)
                }
                TempTableKind::Codelist => {
                    format!("DROP TABLE IF EXISTS {}", table.name)
                }
            })
            .collect()
    }

    fn date_difference_in_years(&self, start: SqlExpr, end: SqlExpr) -> SqlExpr {
        // months_between is day-of-month aware, so completed years fall out
        // of integer division by twelve.
        SqlExpr::cast(
            SqlExpr::func(
                "FLOOR",
                vec![SqlExpr::binary(
                    BinaryOp::Divide,
                    SqlExpr::func("months_between", vec![end, start]),
                    SqlExpr::lit(12),
                )],
            ),
            "INT",
        )
    }

    fn round_to_first_of_month(&self, date: SqlExpr) -> SqlExpr {
        SqlExpr::cast(
            SqlExpr::func("date_trunc", vec![SqlExpr::lit("MONTH"), date]),
            "DATE",
        )
    }

    fn round_to_first_of_year(&self, date: SqlExpr) -> SqlExpr {
        SqlExpr::cast(
            SqlExpr::func("date_trunc", vec![SqlExpr::lit("YEAR"), date]),
            "DATE",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_names_follow_the_convention() {
        let namer = TempNamer::new();
        let name = namer.name("group_table_0");
        assert!(name.starts_with("tmp_"));
        assert!(name.ends_with("_group_table_0"));
        // tmp_ + 8 date digits + _ + 12 hex + _ + hint
        assert_eq!(name.len(), "tmp_".len() + 8 + 1 + 12 + 1 + "group_table_0".len());
    }

    #[test]
    fn canonical_year_difference_adjusts_for_unreached_anniversary() {
        let dialect = GenericDialect::with_namer(TempNamer::with_prefix("tmp_x_"));
        let expr = dialect.date_difference_in_years(
            SqlExpr::col("t", "date_of_birth"),
            SqlExpr::lit("2020-06-01"),
        );
        let sql = expr.to_sql(&dialect.render_options());
        assert_eq!(
            sql,
            "CASE WHEN (DATEADD(YEAR, DATEDIFF(YEAR, t.date_of_birth, '2020-06-01'), \
             t.date_of_birth) > '2020-06-01') \
             THEN (DATEDIFF(YEAR, t.date_of_birth, '2020-06-01') - 1) \
             ELSE DATEDIFF(YEAR, t.date_of_birth, '2020-06-01') END"
        );
    }

    #[test]
    fn spark_year_difference_uses_months_between() {
        let dialect = SparkDialect::with_namer(TempNamer::with_prefix("tmp_x_"));
        let expr = dialect
            .date_difference_in_years(SqlExpr::col("t", "dob"), SqlExpr::col("t", "index_date"));
        assert_eq!(
            expr.to_sql(&dialect.render_options()),
            "CAST(FLOOR((months_between(t.index_date, t.dob) / 12)) AS INT)"
        );
    }

    #[test]
    fn mssql_writes_queries_with_select_into() {
        let dialect = MssqlDialect::with_namer(TempNamer::with_prefix("tmp_x_"));
        assert_eq!(
            dialect.write_query_to_table("tmp_x_group_table_0", "SELECT 1 AS a"),
            "SELECT * INTO tmp_x_group_table_0 FROM (SELECT 1 AS a) AS anon"
        );
        assert_eq!(dialect.max_rows_per_insert(), Some(999));
        assert_eq!(dialect.codelist_collation(), Some("Latin1_General_BIN"));
    }

    #[test]
    fn spark_cleanup_drops_views_and_codelist_tables() {
        let dialect = SparkDialect::with_namer(TempNamer::with_prefix("tmp_x_"));
        let statements = dialect.cleanup_statements(&[
            TempTable {
                name: "tmp_x_codelist_0".into(),
                kind: TempTableKind::Codelist,
            },
            TempTable {
                name: "tmp_x_group_table_0".into(),
                kind: TempTableKind::OutputGroup,
            },
        ]);
        assert_eq!(
            statements,
            vec![
                "DROP TABLE IF EXISTS tmp_x_codelist_0",
                "DROP VIEW IF EXISTS tmp_x_group_table_0",
            ]
        );
    }
}
