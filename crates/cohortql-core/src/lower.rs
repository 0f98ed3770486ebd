//! Lowering from the query algebra to dialect-neutral SELECT statements.
//!
//! Each output group lowers to one SELECT over its linearized chain
//! (`Table -> Filter* -> Row?`), with aggregation folded in for aggregate
//! groups. Filter values interact with the base query in three ways: a
//! patient-level value LEFT JOINs its interim table, an event-level column
//! becomes a correlated subquery, and a codelist becomes a membership
//! subquery restricted by the base table's `system` column when present.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;

use crate::catalog::{BackendCatalog, TableExpression, PATIENT_ID_COLUMN};
use crate::dag::{self, GroupKey, OutputGroup};
use crate::dialect::Dialect;
use crate::error::CompileError;
use crate::query::{
    Comparator, Connector, Node, NodeId, Operand, Operator, OutputKind, QueryNode,
    ValueFromFunction,
};
use crate::sql::{
    BinaryOp, Join, OrderTerm, SelectColumn, SelectQuery, SqlExpr, TableFactor,
};

const ROW_NUMBER_COLUMN: &str = "_row_num";

/// Lowering context: the catalog and dialect plus the per-run names chosen
/// for every interim and codelist table.
pub(crate) struct Lowerer<'a> {
    pub catalog: &'a dyn BackendCatalog,
    pub dialect: &'a dyn Dialect,
    pub group_tables: &'a IndexMap<GroupKey, String>,
    pub codelist_tables: &'a HashMap<NodeId, String>,
}

impl<'a> Lowerer<'a> {
    /// Lowers one output group to the SELECT that computes all its outputs.
    pub fn lower_group(
        &self,
        key: &GroupKey,
        group: &OutputGroup,
    ) -> Result<SelectQuery, CompileError> {
        let chain = dag::linearize(&group.source)?;
        match key.kind {
            OutputKind::ValueFromRow if chain.row.is_none() => {
                return Err(CompileError::shape(
                    "picked-row values must be drawn from a row picker".to_string(),
                ));
            }
            OutputKind::Column | OutputKind::ValueFromAggregate if chain.row.is_some() => {
                return Err(CompileError::shape(
                    "columns and aggregates cannot be drawn from a row picker".to_string(),
                ));
            }
            _ => {}
        }

        let QueryNode::Table(base_table) = chain.table.as_ref() else {
            unreachable!("linearized chains start at a table");
        };
        let base = self.catalog.table_expression(&base_table.name)?;

        // Every query selects patient_id plus the columns the outputs read,
        // sorted so the emitted SQL is deterministic.
        let mut selected: BTreeSet<String> = BTreeSet::new();
        selected.insert(PATIENT_ID_COLUMN.to_string());
        for output in &group.outputs {
            let column = match output.as_ref() {
                QueryNode::Column(c) => &c.column,
                QueryNode::ValueFromRow(v) => &v.column,
                QueryNode::ValueFromAggregate(v) => &v.column,
                _ => unreachable!("output groups only contain output nodes"),
            };
            base.require_column(column)?;
            selected.insert(column.clone());
        }

        let mut query = SelectQuery::new(base.factor.clone());
        for column in &selected {
            query
                .columns
                .push(SelectColumn::plain(SqlExpr::col(&base.name, column)));
        }

        for filter in &chain.filters {
            let QueryNode::FilteredTable(filter) = filter.as_ref() else {
                unreachable!("linearized filters are filter nodes");
            };
            self.apply_filter(&mut query, filter, &base)?;
        }

        if let Some(row) = &chain.row {
            let QueryNode::Row(row) = row.as_ref() else {
                unreachable!("linearized row picker is a row node");
            };
            query = self.apply_row_picker(query, &row.sort_columns, row.descending, &base, &selected)?;
        }

        if key.kind == OutputKind::ValueFromAggregate {
            query = self.apply_aggregates(query, &base, &group.outputs)?;
        }

        Ok(query)
    }

    fn apply_filter(
        &self,
        query: &mut SelectQuery,
        filter: &crate::query::FilteredTable,
        base: &TableExpression,
    ) -> Result<(), CompileError> {
        base.require_column(&filter.column)?;
        let column = SqlExpr::col(&base.name, &filter.column);

        let mut predicate = match &filter.value {
            Operand::Literal(literal) => compare(
                column.clone(),
                filter.operator,
                SqlExpr::Literal(literal.clone()),
            )?,
            Operand::Node(value) => match value.as_ref() {
                QueryNode::Codelist(codelist) => {
                    let subquery =
                        self.codelist_subquery(value, base, codelist.system.as_str())?;
                    membership(column.clone(), filter.operator, subquery)?
                }
                QueryNode::Column(_) => {
                    // Multiple values per patient cannot be joined into a
                    // one-row-per-patient query, so correlate instead.
                    let key = GroupKey::of(value).expect("columns are output nodes");
                    let table = self.group_table(&key)?;
                    let output_column = value.output_column_name().unwrap();
                    let mut subquery = SelectQuery::new(TableFactor::Named {
                        name: table.clone(),
                    });
                    subquery
                        .columns
                        .push(SelectColumn::plain(SqlExpr::col(&table, &output_column)));
                    subquery.predicates.push(SqlExpr::binary(
                        BinaryOp::Eq,
                        SqlExpr::col(&table, PATIENT_ID_COLUMN),
                        SqlExpr::col(&base.name, PATIENT_ID_COLUMN),
                    ));
                    membership(column.clone(), filter.operator, subquery)?
                }
                node if node.is_value() => {
                    let (expr, tables) = self.value_expression(value)?;
                    let [table] = tables.as_slice() else {
                        return Err(CompileError::shape(format!(
                            "filter value ({}) must derive from a single interim table",
                            node.describe()
                        )));
                    };
                    join_once(query, table, &base.name);
                    compare(column.clone(), filter.operator, expr)?
                }
                other => {
                    return Err(CompileError::shape(format!(
                        "filter values must be literals, values, columns or codelists, \
                         found {}",
                        other.describe()
                    )))
                }
            },
        };

        if filter.or_null {
            predicate = SqlExpr::or(predicate, SqlExpr::is_null(column));
        }
        query.predicates.push(predicate);
        Ok(())
    }

    /// `SELECT code FROM <codelist table>`, restricted by the base table's
    /// `system` column when one is present: a row whose coding system
    /// differs never matches, even when the code text collides.
    fn codelist_subquery(
        &self,
        codelist: &Node,
        base: &TableExpression,
        system: &str,
    ) -> Result<SelectQuery, CompileError> {
        let table = self
            .codelist_tables
            .get(&NodeId::of(codelist))
            .ok_or_else(|| {
                CompileError::shape("codelist was not collected during analysis".to_string())
            })?;
        let mut subquery = SelectQuery::new(TableFactor::Named {
            name: table.clone(),
        });
        subquery
            .columns
            .push(SelectColumn::plain(SqlExpr::col(table, "code")));
        if base.has_system_column() {
            subquery.predicates.push(SqlExpr::binary(
                BinaryOp::Eq,
                SqlExpr::col(&base.name, "system"),
                SqlExpr::lit(system),
            ));
        }
        Ok(subquery)
    }

    fn apply_row_picker(
        &self,
        mut query: SelectQuery,
        sort_columns: &[String],
        descending: bool,
        base: &TableExpression,
        selected: &BTreeSet<String>,
    ) -> Result<SelectQuery, CompileError> {
        let mut order_by = Vec::new();
        for column in sort_columns {
            base.require_column(column)?;
            order_by.push(OrderTerm {
                expr: SqlExpr::col(&base.name, column),
                descending,
            });
        }
        query.columns.push(SelectColumn::aliased(
            SqlExpr::RowNumber {
                partition_by: Box::new(SqlExpr::col(&base.name, PATIENT_ID_COLUMN)),
                order_by,
            },
            ROW_NUMBER_COLUMN,
        ));

        let mut outer = SelectQuery::new(TableFactor::Subquery {
            query: Box::new(query),
            alias: base.name.clone(),
        });
        for column in selected {
            outer
                .columns
                .push(SelectColumn::plain(SqlExpr::col(&base.name, column)));
        }
        outer.predicates.push(SqlExpr::binary(
            BinaryOp::Eq,
            SqlExpr::col(&base.name, ROW_NUMBER_COLUMN),
            SqlExpr::lit(1),
        ));
        Ok(outer)
    }

    fn apply_aggregates(
        &self,
        mut query: SelectQuery,
        base: &TableExpression,
        outputs: &[Node],
    ) -> Result<SelectQuery, CompileError> {
        let patient_id = SqlExpr::col(&base.name, PATIENT_ID_COLUMN);
        let mut columns = vec![SelectColumn::plain(patient_id.clone())];
        for output in outputs {
            let QueryNode::ValueFromAggregate(aggregate) = output.as_ref() else {
                unreachable!("aggregate groups only contain aggregate nodes");
            };
            let alias = output.output_column_name().unwrap();
            let expr = match aggregate.function {
                crate::query::AggregateFunction::Exists => SqlExpr::lit(true),
                function => SqlExpr::func(
                    function.sql_function(),
                    vec![SqlExpr::col(&base.name, &aggregate.column)],
                ),
            };
            columns.push(SelectColumn::aliased(expr, alias));
        }
        query.columns = columns;
        query.group_by = vec![patient_id];
        Ok(query)
    }

    /// The expression selecting a patient-level value from its interim
    /// table(s), plus the tables the expression reads.
    pub fn value_expression(
        &self,
        value: &Node,
    ) -> Result<(SqlExpr, Vec<String>), CompileError> {
        match value.as_ref() {
            QueryNode::Column(_) | QueryNode::ValueFromRow(_) | QueryNode::ValueFromAggregate(_) => {
                let key = GroupKey::of(value).expect("output nodes have group keys");
                let table = self.group_table(&key)?;
                let column = value.output_column_name().unwrap();
                Ok((SqlExpr::col(&table, column), vec![table]))
            }
            QueryNode::ValueFromCategory(category) => {
                let parents = dag::category_parents(&category.definitions)?;
                let mut tables = Vec::new();
                for parent in &parents {
                    let key = GroupKey::of(parent).expect("category parents are output nodes");
                    let table = self.group_table(&key)?;
                    if !tables.contains(&table) {
                        tables.push(table);
                    }
                }
                let mut branches = Vec::new();
                for (label, comparator) in &category.definitions {
                    branches.push((
                        self.comparator_expression(comparator)?,
                        SqlExpr::lit(label.as_str()),
                    ));
                }
                let case = SqlExpr::Case {
                    branches,
                    default: Box::new(SqlExpr::Literal(category.default.clone())),
                };
                Ok((case, tables))
            }
            QueryNode::ValueFromFunction(function) => self.function_expression(function),
            other => Err(CompileError::shape(format!(
                "expected a patient-level value, found {}",
                other.describe()
            ))),
        }
    }

    fn comparator_expression(&self, comparator: &Comparator) -> Result<SqlExpr, CompileError> {
        let expr = match comparator {
            Comparator::Compare {
                lhs,
                operator,
                rhs,
                negated,
            } => {
                if !lhs.is_value() && lhs.output_kind() != Some(OutputKind::Column) {
                    return Err(CompileError::shape(format!(
                        "comparator left-hand side must be a value, found {}",
                        lhs.describe()
                    )));
                }
                let (lhs_expr, _) = self.value_expression(lhs)?;
                let expr = match rhs {
                    Operand::Literal(literal) => compare(
                        lhs_expr,
                        *operator,
                        SqlExpr::Literal(literal.clone()),
                    )?,
                    Operand::Node(node) => {
                        let (rhs_expr, _) = self.value_expression(node)?;
                        compare(lhs_expr, *operator, rhs_expr)?
                    }
                };
                if *negated {
                    SqlExpr::Not(Box::new(expr))
                } else {
                    expr
                }
            }
            Comparator::Combine {
                connector,
                lhs,
                rhs,
                negated,
            } => {
                let lhs = self.comparator_expression(lhs)?;
                let rhs = self.comparator_expression(rhs)?;
                let expr = match connector {
                    Connector::And => SqlExpr::and(lhs, rhs),
                    Connector::Or => SqlExpr::or(lhs, rhs),
                };
                if *negated {
                    SqlExpr::Not(Box::new(expr))
                } else {
                    expr
                }
            }
        };
        Ok(expr)
    }

    fn function_expression(
        &self,
        function: &ValueFromFunction,
    ) -> Result<(SqlExpr, Vec<String>), CompileError> {
        let mut args = Vec::new();
        let mut tables = Vec::new();
        for argument in &function.arguments {
            match argument {
                Operand::Literal(literal) => args.push(SqlExpr::Literal(literal.clone())),
                Operand::Node(node) => {
                    let (expr, arg_tables) = self.value_expression(node)?;
                    args.push(expr);
                    for table in arg_tables {
                        if !tables.contains(&table) {
                            tables.push(table);
                        }
                    }
                }
            }
        }

        use crate::query::FunctionKind;
        let expr = match (function.kind, args.len()) {
            (FunctionKind::DateDifferenceInYears, 2) => {
                let end = args.pop().unwrap();
                let start = args.pop().unwrap();
                self.dialect.date_difference_in_years(start, end)
            }
            (FunctionKind::RoundToFirstOfMonth, 1) => {
                self.dialect.round_to_first_of_month(args.pop().unwrap())
            }
            (FunctionKind::RoundToFirstOfYear, 1) => {
                self.dialect.round_to_first_of_year(args.pop().unwrap())
            }
            (kind, arity) => {
                return Err(CompileError::UnsupportedFunction(format!(
                    "{} with {arity} argument(s)",
                    kind.name()
                )))
            }
        };
        Ok((expr, tables))
    }

    /// The query selecting the included population: `patient_id` rows of the
    /// population value's interim table where the value is true.
    pub fn population_query(&self, population: &Node) -> Result<SelectQuery, CompileError> {
        let (is_included, tables) = self.value_expression(population)?;
        let [table] = tables.as_slice() else {
            return Err(CompileError::shape(
                "population must derive from a single interim table".to_string(),
            ));
        };
        let mut query = SelectQuery::new(TableFactor::Named {
            name: table.clone(),
        });
        query.columns.push(SelectColumn::aliased(
            SqlExpr::col(table, PATIENT_ID_COLUMN),
            PATIENT_ID_COLUMN,
        ));
        query.predicates.push(SqlExpr::binary(
            BinaryOp::Eq,
            is_included,
            SqlExpr::lit(true),
        ));
        Ok(query)
    }

    /// The final results query: the population query with every declared
    /// output's interim table(s) LEFT JOINed and its value projected.
    pub fn results_query(
        &self,
        population: &Node,
        outputs: &[(String, Node)],
    ) -> Result<SelectQuery, CompileError> {
        let mut query = self.population_query(population)?;
        let population_table = query.from.reference_name().to_string();
        for (name, node) in outputs {
            let (expr, tables) = self.value_expression(node)?;
            for table in &tables {
                join_once(&mut query, table, &population_table);
            }
            query.columns.push(SelectColumn::aliased(expr, name));
        }
        Ok(query)
    }

    fn group_table(&self, key: &GroupKey) -> Result<String, CompileError> {
        self.group_tables.get(key).cloned().ok_or_else(|| {
            CompileError::shape("value refers to a group missing from the analysis".to_string())
        })
    }
}

/// LEFT JOINs an interim table on `patient_id`, at most once per query.
fn join_once(query: &mut SelectQuery, table: &str, base: &str) {
    if query.references_table(table) {
        return;
    }
    query.joins.push(Join {
        factor: TableFactor::Named {
            name: table.to_string(),
        },
        on: SqlExpr::binary(
            BinaryOp::Eq,
            SqlExpr::col(base, PATIENT_ID_COLUMN),
            SqlExpr::col(table, PATIENT_ID_COLUMN),
        ),
        left_outer: true,
    });
}

fn comparison_op(operator: Operator) -> Option<BinaryOp> {
    match operator {
        Operator::Equals => Some(BinaryOp::Eq),
        Operator::NotEquals => Some(BinaryOp::NotEq),
        Operator::LessThan => Some(BinaryOp::Lt),
        Operator::LessThanOrEquals => Some(BinaryOp::LtEq),
        Operator::GreaterThan => Some(BinaryOp::Gt),
        Operator::GreaterThanOrEquals => Some(BinaryOp::GtEq),
        Operator::In | Operator::NotIn => None,
    }
}

/// A plain comparison; membership operators require a subquery operand.
fn compare(lhs: SqlExpr, operator: Operator, rhs: SqlExpr) -> Result<SqlExpr, CompileError> {
    match comparison_op(operator) {
        Some(op) => Ok(SqlExpr::binary(op, lhs, rhs)),
        None => Err(CompileError::shape(
            "membership filters require a codelist or column value".to_string(),
        )),
    }
}

/// Applies an operator against a subquery operand: membership operators
/// lower to IN / NOT IN, the rest compare against the subquery as a scalar.
fn membership(
    lhs: SqlExpr,
    operator: Operator,
    subquery: SelectQuery,
) -> Result<SqlExpr, CompileError> {
    match operator {
        Operator::In => Ok(SqlExpr::InSubquery {
            expr: Box::new(lhs),
            subquery: Box::new(subquery),
            negated: false,
        }),
        Operator::NotIn => Ok(SqlExpr::InSubquery {
            expr: Box::new(lhs),
            subquery: Box::new(subquery),
            negated: true,
        }),
        other => Ok(SqlExpr::binary(
            comparison_op(other).expect("membership operators handled above"),
            lhs,
            SqlExpr::ScalarSubquery(Box::new(subquery)),
        )),
    }
}
