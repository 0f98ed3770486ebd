//! Plan assembly: sequencing codelist creation, interim-table
//! materialization, and the final join query into an ordered statement list.
//!
//! The ordering guarantee is structural: codelist tables come first, output
//! groups follow in first-appearance order (which the analyzer already
//! topologically sorted), and the final query is last, so executing the list
//! in order on a single session never references a table before it exists.

use serde::Serialize;

use crate::dialect::{Dialect, TempTable, TempTableKind};
use crate::error::CompileError;
use crate::query::Codelist;
use crate::sql::SelectQuery;

/// Maximum length of the codelist `system` column.
const SYSTEM_COLUMN_WIDTH: usize = 6;

/// Why a statement is in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementPurpose {
    CreateCodelistTable,
    PopulateCodelistTable,
    MaterializeOutputGroup,
    FinalResults,
    Cleanup,
}

/// One SQL statement of the compiled plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStatement {
    pub purpose: StatementPurpose,
    pub sql: String,
}

/// The compiled plan: statements to execute in order, cleanup statements to
/// run on every exit path afterwards, and the final result's column order.
#[derive(Debug, Clone, Serialize)]
pub struct CohortPlan {
    pub statements: Vec<PlanStatement>,
    pub cleanup: Vec<PlanStatement>,
    /// `patient_id` first, then declared columns in input order.
    pub result_columns: Vec<String>,
}

impl CohortPlan {
    /// The statements' SQL text, in execution order.
    pub fn sql_statements(&self) -> impl Iterator<Item = &str> {
        self.statements.iter().map(|s| s.sql.as_str())
    }
}

/// Sequences the prepared pieces into an executable plan.
pub(crate) fn assemble(
    dialect: &dyn Dialect,
    codelists: &[(String, &Codelist)],
    groups: &[(String, SelectQuery)],
    final_query: &SelectQuery,
    output_names: &[String],
) -> Result<CohortPlan, CompileError> {
    let opts = dialect.render_options();
    let mut statements = Vec::new();
    let mut temp_tables = Vec::new();

    for (name, codelist) in codelists {
        statements.push(PlanStatement {
            purpose: StatementPurpose::CreateCodelistTable,
            sql: codelist_table_ddl(dialect, name, codelist)?,
        });
        for insert in codelist_insert_statements(dialect, name, codelist) {
            statements.push(PlanStatement {
                purpose: StatementPurpose::PopulateCodelistTable,
                sql: insert,
            });
        }
        temp_tables.push(TempTable {
            name: name.clone(),
            kind: TempTableKind::Codelist,
        });
    }

    for (table, query) in groups {
        statements.push(PlanStatement {
            purpose: StatementPurpose::MaterializeOutputGroup,
            sql: dialect.write_query_to_table(table, &query.to_sql(&opts)),
        });
        temp_tables.push(TempTable {
            name: table.clone(),
            kind: TempTableKind::OutputGroup,
        });
    }

    statements.push(PlanStatement {
        purpose: StatementPurpose::FinalResults,
        sql: final_query.to_sql(&opts),
    });

    let cleanup = dialect
        .cleanup_statements(&temp_tables)
        .into_iter()
        .map(|sql| PlanStatement {
            purpose: StatementPurpose::Cleanup,
            sql,
        })
        .collect();

    let mut result_columns = Vec::with_capacity(output_names.len() + 1);
    result_columns.push(crate::catalog::PATIENT_ID_COLUMN.to_string());
    result_columns.extend(output_names.iter().cloned());

    Ok(CohortPlan {
        statements,
        cleanup,
        result_columns,
    })
}

/// `CREATE TABLE` for a codelist: a `code` column sized to the longest code
/// with a case-sensitive collation where the dialect needs one, and a
/// `system` column.
fn codelist_table_ddl(
    dialect: &dyn Dialect,
    name: &str,
    codelist: &Codelist,
) -> Result<String, CompileError> {
    let max_code_len = codelist
        .codes
        .iter()
        .map(|code| code.len())
        .max()
        .ok_or_else(|| CompileError::Codelist("codelist contains no codes".to_string()))?;
    if codelist.system.len() > SYSTEM_COLUMN_WIDTH {
        return Err(CompileError::Codelist(format!(
            "system identifier '{}' exceeds {SYSTEM_COLUMN_WIDTH} characters",
            codelist.system
        )));
    }

    let code_type = dialect.sql_type(crate::catalog::ColumnType::Code);
    let system_type = dialect.sql_type(crate::catalog::ColumnType::Varchar);
    let collation = match dialect.codelist_collation() {
        Some(collation) => format!(" COLLATE {collation}"),
        None => String::new(),
    };
    Ok(format!(
        "CREATE TABLE {name} (code {code_type}({max_code_len}){collation} NOT NULL, \
         system {system_type}({SYSTEM_COLUMN_WIDTH}) NOT NULL)"
    ))
}

/// Batched INSERTs respecting the dialect's per-statement row cap. Codes are
/// inserted in sorted order so plans are reproducible.
fn codelist_insert_statements(
    dialect: &dyn Dialect,
    name: &str,
    codelist: &Codelist,
) -> Vec<String> {
    let codes: Vec<&String> = codelist.codes.iter().collect();
    let batch_size = dialect.max_rows_per_insert().unwrap_or(codes.len().max(1));

    codes
        .chunks(batch_size)
        .map(|batch| {
            let rows: Vec<String> = batch
                .iter()
                .map(|code| {
                    format!(
                        "('{}', '{}')",
                        code.replace('\'', "''"),
                        codelist.system.replace('\'', "''"),
                    )
                })
                .collect();
            format!(
                "INSERT INTO {name} (code, system) VALUES {}",
                rows.join(", ")
            )
        })
        .collect()
}
