//! The compiler entry point: one disposable [`CohortCompiler`] per run.
//!
//! A run is single-shot and sequential: analysis partitions the DAG into
//! output groups and codelists, lowering turns each group into a SELECT, and
//! assembly sequences codelist creation, interim-table materialization, and
//! the final join query into an ordered statement list. `compile` consumes
//! the compiler, so the `Empty -> Analyzed -> Lowered -> Assembled`
//! progression cannot be replayed or interleaved.

use std::collections::HashMap;

use indexmap::IndexMap;
#[cfg(feature = "tracing")]
use tracing::debug;

use crate::catalog::BackendCatalog;
use crate::dag::{self, GroupKey};
use crate::dialect::Dialect;
use crate::error::CompileError;
use crate::lower::Lowerer;
use crate::plan::{self, CohortPlan};
use crate::query::{table, Node, NodeId, QueryNode};

/// The reserved column driving the final row filter. It never appears in
/// the output itself.
pub const POPULATION_COLUMN: &str = "population";

/// Compiles one cohort specification against one catalog and dialect.
pub struct CohortCompiler<'a> {
    definitions: IndexMap<String, Node>,
    catalog: &'a dyn BackendCatalog,
    dialect: &'a dyn Dialect,
    sql_sink: Option<Box<dyn FnMut(&str) + 'a>>,
}

impl<'a> CohortCompiler<'a> {
    /// Creates a compiler for the given column definitions.
    ///
    /// When no `population` column is declared, patients registered in
    /// `practice_registrations` are included by default.
    pub fn new(
        mut definitions: IndexMap<String, Node>,
        catalog: &'a dyn BackendCatalog,
        dialect: &'a dyn Dialect,
    ) -> Self {
        if !definitions.contains_key(POPULATION_COLUMN) {
            definitions.insert(
                POPULATION_COLUMN.to_string(),
                table("practice_registrations").exists(),
            );
        }
        CohortCompiler {
            definitions,
            catalog,
            dialect,
            sql_sink: None,
        }
    }

    /// Installs a debug sink invoked with each emitted statement's SQL, in
    /// execution order.
    pub fn with_sql_sink(mut self, sink: impl FnMut(&str) + 'a) -> Self {
        self.sql_sink = Some(Box::new(sink));
        self
    }

    /// Runs the compilation and returns the ordered plan.
    pub fn compile(mut self) -> Result<CohortPlan, CompileError> {
        for (name, node) in &self.definitions {
            if !node.is_value() {
                return Err(CompileError::shape(format!(
                    "declared output '{name}' must be a patient-level value, found {}",
                    node.describe()
                )));
            }
        }

        // Analyzed: partition the DAG and fix every per-run table name.
        let dag = dag::analyze(&self.definitions)?;

        let mut codelist_tables = HashMap::new();
        let mut codelist_names = Vec::new();
        for (i, codelist) in dag.codelists.iter().enumerate() {
            let name = self.dialect.temp_table_name(&format!("codelist_{i}"));
            codelist_tables.insert(NodeId::of(codelist), name.clone());
            codelist_names.push((name, codelist.clone()));
        }

        let mut group_tables: IndexMap<GroupKey, String> = IndexMap::new();
        for (i, key) in dag.groups.keys().enumerate() {
            group_tables.insert(*key, self.dialect.temp_table_name(&format!("group_table_{i}")));
        }

        // Lowered: one SELECT per output group, plus the final join query.
        let lowerer = Lowerer {
            catalog: self.catalog,
            dialect: self.dialect,
            group_tables: &group_tables,
            codelist_tables: &codelist_tables,
        };

        let mut group_queries = Vec::new();
        for (key, group) in &dag.groups {
            let query = lowerer.lower_group(key, group)?;
            group_queries.push((group_tables[key].clone(), query));
        }

        let population = self.definitions[POPULATION_COLUMN].clone();
        let outputs: Vec<(String, Node)> = self
            .definitions
            .iter()
            .filter(|(name, _)| name.as_str() != POPULATION_COLUMN)
            .map(|(name, node)| (name.clone(), node.clone()))
            .collect();
        let final_query = lowerer.results_query(&population, &outputs)?;

        // Assembled: sequence everything into the ordered statement list.
        let codelist_pairs: Vec<(String, &crate::query::Codelist)> = codelist_names
            .iter()
            .map(|(name, node)| {
                let QueryNode::Codelist(codelist) = node.as_ref() else {
                    unreachable!("collected codelists are codelist nodes");
                };
                (name.clone(), codelist)
            })
            .collect();
        let output_names: Vec<String> = outputs.iter().map(|(name, _)| name.clone()).collect();
        let plan = plan::assemble(
            self.dialect,
            &codelist_pairs,
            &group_queries,
            &final_query,
            &output_names,
        )?;

        if let Some(sink) = self.sql_sink.as_mut() {
            for sql in plan.sql_statements() {
                sink(sql);
            }
        }
        #[cfg(feature = "tracing")]
        debug!(
            dialect = self.dialect.name(),
            statements = plan.statements.len(),
            "compiled cohort plan"
        );

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ColumnType, StaticCatalog};
    use crate::dialect::{GenericDialect, TempNamer};
    use crate::plan::StatementPurpose;
    use crate::query::FilterOp;

    fn catalog() -> StaticCatalog {
        StaticCatalog::new("PatientId")
            .mapped_table(
                "practice_registrations",
                "practice_registrations",
                vec![
                    (
                        "date_start",
                        ColumnDef::mapped(ColumnType::Date, "StartDate"),
                    ),
                    ("date_end", ColumnDef::mapped(ColumnType::Date, "EndDate")),
                ],
            )
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
    }

    fn dialect() -> GenericDialect {
        GenericDialect::with_namer(TempNamer::with_prefix("tmp_20210101_abcdef123456_"))
    }

    #[test]
    fn population_defaults_to_registration_exists() {
        let catalog = catalog();
        let dialect = dialect();
        let plan = CohortCompiler::new(IndexMap::new(), &catalog, &dialect)
            .compile()
            .unwrap();

        assert_eq!(plan.result_columns, vec!["patient_id"]);
        let final_sql = &plan.statements.last().unwrap().sql;
        assert_eq!(
            final_sql,
            "SELECT tmp_20210101_abcdef123456_group_table_0.patient_id AS patient_id \
             FROM tmp_20210101_abcdef123456_group_table_0 \
             WHERE (tmp_20210101_abcdef123456_group_table_0.patient_id_exists = TRUE)"
        );

        let purposes: Vec<StatementPurpose> =
            plan.statements.iter().map(|s| s.purpose).collect();
        assert_eq!(
            purposes,
            vec![
                StatementPurpose::MaterializeOutputGroup,
                StatementPurpose::FinalResults,
            ]
        );
    }

    #[test]
    fn compilation_is_deterministic_for_a_fixed_prefix() {
        let build = || {
            let sex = table("patients").last_by(&["date_of_birth"]).get("sex");
            let mut definitions = IndexMap::new();
            definitions.insert("sex".to_string(), sex);
            definitions
        };
        let catalog = catalog();

        let dialect_a = dialect();
        let plan_a = CohortCompiler::new(build(), &catalog, &dialect_a)
            .compile()
            .unwrap();
        let dialect_b = dialect();
        let plan_b = CohortCompiler::new(build(), &catalog, &dialect_b)
            .compile()
            .unwrap();

        let sql_a: Vec<&str> = plan_a.sql_statements().collect();
        let sql_b: Vec<&str> = plan_b.sql_statements().collect();
        assert_eq!(sql_a, sql_b);
    }

    #[test]
    fn result_columns_follow_input_order() {
        let sex = table("patients").last_by(&["date_of_birth"]).get("sex");
        let dob = table("patients").last_by(&["date_of_birth"]).get("date_of_birth");
        let mut definitions = IndexMap::new();
        definitions.insert("sex".to_string(), sex);
        definitions.insert("dob".to_string(), dob);

        let catalog = catalog();
        let dialect = dialect();
        let plan = CohortCompiler::new(definitions, &catalog, &dialect)
            .compile()
            .unwrap();
        assert_eq!(plan.result_columns, vec!["patient_id", "sex", "dob"]);
    }

    #[test]
    fn event_level_output_is_rejected() {
        let codes = table("patients").get("sex");
        let mut definitions = IndexMap::new();
        definitions.insert("codes".to_string(), codes);

        let catalog = catalog();
        let dialect = dialect();
        let err = CohortCompiler::new(definitions, &catalog, &dialect)
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("declared output 'codes'"));
    }

    #[test]
    fn sql_sink_sees_every_statement() {
        let sex = table("patients")
            .filter("sex", FilterOp::NotEquals, "")
            .last_by(&["date_of_birth"])
            .get("sex");
        let mut definitions = IndexMap::new();
        definitions.insert("sex".to_string(), sex);

        let catalog = catalog();
        let dialect = dialect();
        let mut seen = Vec::new();
        let plan = CohortCompiler::new(definitions, &catalog, &dialect)
            .with_sql_sink(|sql| seen.push(sql.to_string()))
            .compile()
            .unwrap();
        assert_eq!(seen.len(), plan.statements.len());
        assert!(seen.last().unwrap().starts_with("SELECT "));
    }
}
