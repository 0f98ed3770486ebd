//! Universal properties of compiled plans, checked over generated cohorts.

mod common;

use std::collections::HashSet;

use cohortql_core::{
    codelist, table, CohortCompiler, CohortPlan, FilterOp, Node, StatementPurpose,
};
use common::*;
use proptest::prelude::*;

/// Every `tmp_`-prefixed name appearing in a statement, in order.
fn temp_names(sql: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = sql;
    while let Some(pos) = rest.find(TEMP_PREFIX) {
        let name: String = rest[pos..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        names.push(name);
        rest = &rest[pos + TEMP_PREFIX.len()..];
    }
    names
}

/// Asserts that every temp table referenced by statement `i` was created by
/// some statement `j < i`.
fn assert_topologically_sound(plan: &CohortPlan) {
    let mut created: HashSet<String> = HashSet::new();
    for statement in &plan.statements {
        let names = temp_names(&statement.sql);
        match statement.purpose {
            StatementPurpose::CreateCodelistTable | StatementPurpose::MaterializeOutputGroup => {
                let (target, references) = names
                    .split_first()
                    .expect("creation statements name their target");
                for name in references {
                    assert!(
                        created.contains(name),
                        "{name} referenced before creation in: {}",
                        statement.sql
                    );
                }
                created.insert(target.clone());
            }
            _ => {
                for name in &names {
                    assert!(
                        created.contains(name),
                        "{name} referenced before creation in: {}",
                        statement.sql
                    );
                }
            }
        }
    }
}

/// A generated cohort: a filtered event chain feeding an aggregate, with
/// optional extras exercising row pickers and codelist membership.
fn build_definitions(
    threshold: i64,
    extra_filters: usize,
    use_picker: bool,
    with_codelist: bool,
) -> Vec<(&'static str, Node)> {
    let mut events = table("clinical_events").filter("value", FilterOp::GreaterThan, threshold);
    for i in 0..extra_filters {
        events = events.filter("value", FilterOp::LessThan, threshold + 10 + i as i64);
    }
    if with_codelist {
        let cl = codelist(vec!["abc", "def"], "snomed");
        events = events.filter("code", FilterOp::IsIn, &cl);
    }

    let mut defs: Vec<(&'static str, Node)> = Vec::new();
    if use_picker {
        defs.push(("latest_value", events.last_by(&["date"]).get("value")));
    }
    defs.push(("n", events.count("value")));
    defs
}

proptest! {
    #[test]
    fn every_referenced_table_is_created_earlier(
        threshold in 0i64..100,
        extra_filters in 0usize..3,
        use_picker in any::<bool>(),
        with_codelist in any::<bool>(),
    ) {
        let catalog = mock_catalog();
        let dialect = generic_dialect();
        let defs = build_definitions(threshold, extra_filters, use_picker, with_codelist);
        let plan = CohortCompiler::new(definitions(defs), &catalog, &dialect)
            .compile()
            .unwrap();
        assert_topologically_sound(&plan);

        // The same holds for the other dialects' statement forms.
        let dialect = mssql_dialect();
        let defs = build_definitions(threshold, extra_filters, use_picker, with_codelist);
        let plan = CohortCompiler::new(definitions(defs), &catalog, &dialect)
            .compile()
            .unwrap();
        assert_topologically_sound(&plan);
    }

    #[test]
    fn plans_are_byte_identical_across_runs(
        threshold in 0i64..100,
        extra_filters in 0usize..3,
        use_picker in any::<bool>(),
        with_codelist in any::<bool>(),
    ) {
        let catalog = mock_catalog();

        let dialect_a = generic_dialect();
        let plan_a = CohortCompiler::new(
            definitions(build_definitions(threshold, extra_filters, use_picker, with_codelist)),
            &catalog,
            &dialect_a,
        )
        .compile()
        .unwrap();

        let dialect_b = generic_dialect();
        let plan_b = CohortCompiler::new(
            definitions(build_definitions(threshold, extra_filters, use_picker, with_codelist)),
            &catalog,
            &dialect_b,
        )
        .compile()
        .unwrap();

        let sql_a: Vec<&str> = plan_a.sql_statements().collect();
        let sql_b: Vec<&str> = plan_b.sql_statements().collect();
        prop_assert_eq!(sql_a, sql_b);
        prop_assert_eq!(plan_a.result_columns.clone(), plan_b.result_columns.clone());
    }

    #[test]
    fn outputs_sharing_a_source_share_one_interim_table(
        column_count in 1usize..4,
    ) {
        let catalog = mock_catalog();
        let dialect = generic_dialect();
        let picked = table("patients").last_by(&["date_of_birth"]);
        let columns = ["sex", "date_of_birth", "height"];
        let defs: Vec<(&str, Node)> = columns[..column_count]
            .iter()
            .map(|column| (*column, picked.get(column)))
            .collect();

        let plan = CohortCompiler::new(definitions(defs), &catalog, &dialect)
            .compile()
            .unwrap();
        let materializations = plan
            .statements
            .iter()
            .filter(|s| s.purpose == StatementPurpose::MaterializeOutputGroup)
            .count();
        // One shared picked-row table plus the default population.
        prop_assert_eq!(materializations, 2);
    }

    #[test]
    fn default_population_drives_the_final_filter(
        threshold in 0i64..100,
    ) {
        let catalog = mock_catalog();
        let dialect = generic_dialect();
        let defs = build_definitions(threshold, 0, false, false);
        let plan = CohortCompiler::new(definitions(defs), &catalog, &dialect)
            .compile()
            .unwrap();

        prop_assert!(plan
            .statements
            .iter()
            .any(|s| s.sql.contains("FROM practice_registrations")));
        let final_sql = &plan.statements.last().unwrap().sql;
        prop_assert!(final_sql.contains(".patient_id_exists = TRUE)"));
    }
}
