//! The backend catalog interface the compiler consumes, and a static
//! in-memory implementation.
//!
//! A catalog resolves a logical table name to a dialect-neutral table
//! expression that always exposes `patient_id`: backends with a different
//! physical join column declare it once and every table expression rewrites
//! it. The full backend registry lives outside this crate; [`StaticCatalog`]
//! covers embedders and tests that just need a table mapping.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CompileError;
use crate::sql::TableFactor;

/// The join column every resolved table exposes.
pub const PATIENT_ID_COLUMN: &str = "patient_id";

/// Canonical column types; dialects map these to concrete SQL types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Date,
    DateTime,
    Float,
    Integer,
    Varchar,
    Code,
}

/// Resolves logical table names for the compiler.
pub trait BackendCatalog {
    fn table_expression(&self, name: &str) -> Result<TableExpression, CompileError>;
}

/// A resolved table: a FROM-clause factor aliased by the logical name, plus
/// the columns it exposes.
#[derive(Debug, Clone)]
pub struct TableExpression {
    pub name: String,
    pub factor: TableFactor,
    pub columns: IndexMap<String, ColumnType>,
}

impl TableExpression {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Codelist filters additionally match on `system` when the table has
    /// such a column.
    pub fn has_system_column(&self) -> bool {
        self.has_column("system")
    }

    pub fn require_column(&self, column: &str) -> Result<(), CompileError> {
        if self.has_column(column) {
            Ok(())
        } else {
            Err(CompileError::unknown_column(&self.name, column))
        }
    }
}

/// A declared column of a [`StaticCatalog`] table.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub column_type: ColumnType,
    /// Physical column name when it differs from the exposed name.
    pub source: Option<String>,
}

impl ColumnDef {
    pub fn new(column_type: ColumnType) -> Self {
        ColumnDef {
            column_type,
            source: None,
        }
    }

    pub fn mapped(column_type: ColumnType, source: impl Into<String>) -> Self {
        ColumnDef {
            column_type,
            source: Some(source.into()),
        }
    }
}

#[derive(Debug, Clone)]
enum TableDef {
    /// A physical table with per-column renames.
    Mapped {
        source: String,
        columns: IndexMap<String, ColumnDef>,
    },
    /// A verbatim SQL query already exposing `patient_id`.
    Query {
        sql: String,
        columns: IndexMap<String, ColumnType>,
    },
}

/// An in-memory table mapping with a single patient-join column.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    patient_join_column: String,
    tables: IndexMap<String, TableDef>,
}

impl StaticCatalog {
    pub fn new(patient_join_column: impl Into<String>) -> Self {
        StaticCatalog {
            patient_join_column: patient_join_column.into(),
            tables: IndexMap::new(),
        }
    }

    /// Registers a physical table. `patient_id` is injected from the
    /// catalog's patient-join column unless declared explicitly.
    pub fn mapped_table(
        mut self,
        name: impl Into<String>,
        source: impl Into<String>,
        columns: Vec<(&str, ColumnDef)>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .map(|(name, def)| (name.to_string(), def))
            .collect();
        self.tables.insert(
            name.into(),
            TableDef::Mapped {
                source: source.into(),
                columns,
            },
        );
        self
    }

    /// Registers a table backed by a verbatim SQL query. The query itself
    /// must expose a `patient_id` column.
    pub fn query_table(
        mut self,
        name: impl Into<String>,
        sql: impl Into<String>,
        columns: Vec<(&str, ColumnType)>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .map(|(name, column_type)| (name.to_string(), column_type))
            .collect();
        self.tables.insert(
            name.into(),
            TableDef::Query {
                sql: sql.into(),
                columns,
            },
        );
        self
    }
}

impl BackendCatalog for StaticCatalog {
    fn table_expression(&self, name: &str) -> Result<TableExpression, CompileError> {
        let def = self
            .tables
            .get(name)
            .ok_or_else(|| CompileError::UnknownTable(name.to_string()))?;

        match def {
            TableDef::Mapped { source, columns } => {
                let mut projected = Vec::new();
                let mut exposed = IndexMap::new();
                if !columns.contains_key(PATIENT_ID_COLUMN) {
                    projected.push((self.patient_join_column.clone(), PATIENT_ID_COLUMN.into()));
                    exposed.insert(PATIENT_ID_COLUMN.to_string(), ColumnType::Integer);
                }
                for (column, def) in columns {
                    let physical = def.source.clone().unwrap_or_else(|| column.clone());
                    projected.push((physical, column.clone()));
                    exposed.insert(column.clone(), def.column_type);
                }
                Ok(TableExpression {
                    name: name.to_string(),
                    factor: TableFactor::Projected {
                        source: source.clone(),
                        columns: projected,
                        alias: name.to_string(),
                    },
                    columns: exposed,
                })
            }
            TableDef::Query { sql, columns } => {
                let mut exposed = IndexMap::new();
                if !columns.contains_key(PATIENT_ID_COLUMN) {
                    exposed.insert(PATIENT_ID_COLUMN.to_string(), ColumnType::Integer);
                }
                for (column, column_type) in columns {
                    exposed.insert(column.clone(), *column_type);
                }
                Ok(TableExpression {
                    name: name.to_string(),
                    factor: TableFactor::Derived {
                        sql: sql.clone(),
                        alias: name.to_string(),
                    },
                    columns: exposed,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::RenderOptions;

    fn catalog() -> StaticCatalog {
        StaticCatalog::new("PatientId")
            .mapped_table(
                "patients",
                "patients",
                vec![
                    (
                        "date_of_birth",
                        ColumnDef::mapped(ColumnType::Date, "DateOfBirth"),
                    ),
                    ("sex", ColumnDef::mapped(ColumnType::Varchar, "Sex")),
                ],
            )
            .query_table(
                "positive_tests",
                "SELECT PatientID AS patient_id, PositiveResult AS result FROM all_tests",
                vec![("result", ColumnType::Boolean)],
            )
    }

    #[test]
    fn unknown_table_is_an_error() {
        let err = catalog().table_expression("missing").unwrap_err();
        assert_eq!(err.to_string(), "unknown table 'missing'");
    }

    #[test]
    fn patient_id_is_injected_from_the_join_column() {
        let expr = catalog().table_expression("patients").unwrap();
        assert!(expr.has_column("patient_id"));
        assert!(!expr.has_system_column());

        let mut sql = String::new();
        let TableFactor::Projected { .. } = &expr.factor else {
            panic!("expected projected factor");
        };
        let query = crate::sql::SelectQuery {
            columns: vec![crate::sql::SelectColumn::plain(crate::sql::SqlExpr::col(
                "patients",
                "patient_id",
            ))],
            from: expr.factor.clone(),
            joins: vec![],
            predicates: vec![],
            group_by: vec![],
        };
        sql.push_str(&query.to_sql(&RenderOptions::default()));
        assert_eq!(
            sql,
            "SELECT patients.patient_id FROM (SELECT PatientId AS patient_id, \
             DateOfBirth AS date_of_birth, Sex AS sex FROM patients) AS patients"
        );
    }

    #[test]
    fn query_table_passes_sql_through() {
        let expr = catalog().table_expression("positive_tests").unwrap();
        assert!(expr.has_column("patient_id"));
        assert!(expr.has_column("result"));
        let TableFactor::Derived { sql, .. } = &expr.factor else {
            panic!("expected derived factor");
        };
        assert!(sql.contains("FROM all_tests"));
    }
}
