//! Shared fixtures: a catalog mirroring a small mock backend, and dialects
//! with fixed temp prefixes so emitted SQL is stable enough to assert on.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use cohortql_core::{
    ColumnDef, ColumnType, GenericDialect, MssqlDialect, Node, SparkDialect, StaticCatalog,
    TempNamer,
};
use indexmap::IndexMap;

pub const TEMP_PREFIX: &str = "tmp_20210101_0123abcd4567_";

pub fn mock_catalog() -> StaticCatalog {
    StaticCatalog::new("PatientId")
        .mapped_table(
            "patients",
            "patients",
            vec![
                ("height", ColumnDef::mapped(ColumnType::Integer, "Height")),
                (
                    "date_of_birth",
                    ColumnDef::mapped(ColumnType::Date, "DateOfBirth"),
                ),
                ("sex", ColumnDef::mapped(ColumnType::Varchar, "Sex")),
            ],
        )
        .mapped_table(
            "practice_registrations",
            "practice_registrations",
            vec![
                ("stp", ColumnDef::mapped(ColumnType::Varchar, "StpId")),
                (
                    "date_start",
                    ColumnDef::mapped(ColumnType::Date, "StartDate"),
                ),
                ("date_end", ColumnDef::mapped(ColumnType::Date, "EndDate")),
            ],
        )
        .mapped_table(
            "clinical_events",
            "events",
            vec![
                ("code", ColumnDef::mapped(ColumnType::Code, "EventCode")),
                ("system", ColumnDef::mapped(ColumnType::Varchar, "System")),
                ("date", ColumnDef::mapped(ColumnType::Date, "Date")),
                (
                    "value",
                    ColumnDef::mapped(ColumnType::Float, "ResultValue"),
                ),
            ],
        )
        .query_table(
            "positive_tests",
            "SELECT PatientID AS patient_id, PositiveResult AS result, \
             TestDate AS test_date FROM all_tests",
            vec![
                ("result", ColumnType::Boolean),
                ("test_date", ColumnType::Date),
            ],
        )
}

pub fn generic_dialect() -> GenericDialect {
    GenericDialect::with_namer(TempNamer::with_prefix(TEMP_PREFIX))
}

pub fn mssql_dialect() -> MssqlDialect {
    MssqlDialect::with_namer(TempNamer::with_prefix(TEMP_PREFIX))
}

pub fn spark_dialect() -> SparkDialect {
    SparkDialect::with_namer(TempNamer::with_prefix(TEMP_PREFIX))
}

pub fn definitions(pairs: Vec<(&str, Node)>) -> IndexMap<String, Node> {
    pairs
        .into_iter()
        .map(|(name, node)| (name.to_string(), node))
        .collect()
}

/// The temp table name the fixed-prefix dialects produce for a hint.
pub fn temp_name(hint: &str) -> String {
    format!("{TEMP_PREFIX}{hint}")
}
