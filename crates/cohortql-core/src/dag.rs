//! DAG analysis: topological ordering, output-group partitioning, codelist
//! collection, and chain linearization.
//!
//! The analyzer walks the nodes reachable from the declared outputs and
//! returns them parents-first. Output nodes (columns, picked-row values,
//! aggregates) are grouped by `(kind, source-by-identity)`: every group can
//! be computed by a single SELECT over its source chain, so outputs sharing
//! a derivation path share one interim table. Ordering everywhere is
//! first-appearance order, which keeps the emitted SQL reproducible.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::error::CompileError;
use crate::query::{Comparator, Node, NodeId, Operand, OutputKind, QueryNode};

/// Key identifying an output group: the output kind plus the identity of the
/// shared source node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub kind: OutputKind,
    pub source: NodeId,
}

impl GroupKey {
    pub fn of(output: &Node) -> Option<GroupKey> {
        let kind = output.output_kind()?;
        let source = output.source()?;
        Some(GroupKey {
            kind,
            source: NodeId::of(source),
        })
    }
}

/// The output nodes sharing one `(kind, source)` pair.
#[derive(Debug)]
pub struct OutputGroup {
    pub source: Node,
    pub outputs: Vec<Node>,
}

/// The analyzed query DAG.
#[derive(Debug)]
pub struct QueryDag {
    /// Every reachable node, parents strictly before children.
    pub nodes: Vec<Node>,
    /// Output groups in first-appearance order.
    pub groups: IndexMap<GroupKey, OutputGroup>,
    /// Distinct codelists in first-appearance order.
    pub codelists: Vec<Node>,
}

/// Walks the DAG rooted at the given outputs and partitions it.
pub fn analyze(definitions: &IndexMap<String, Node>) -> Result<QueryDag, CompileError> {
    let nodes = topological(definitions.values())?;

    let mut groups: IndexMap<GroupKey, OutputGroup> = IndexMap::new();
    let mut codelists = Vec::new();
    for node in &nodes {
        if let Some(key) = GroupKey::of(node) {
            let source = node.source().expect("output node has a source");
            groups
                .entry(key)
                .or_insert_with(|| OutputGroup {
                    source: source.clone(),
                    outputs: Vec::new(),
                })
                .outputs
                .push(node.clone());
        }
        if matches!(node.as_ref(), QueryNode::Codelist(_)) {
            codelists.push(node.clone());
        }
    }

    Ok(QueryDag {
        nodes,
        groups,
        codelists,
    })
}

/// Returns every node reachable from `roots` with parents strictly before
/// children. Siblings are visited in the order their parent exposes them, so
/// the result is stable across runs.
pub fn topological<'a>(roots: impl Iterator<Item = &'a Node>) -> Result<Vec<Node>, CompileError> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for root in roots {
        visit(root, &mut seen, &mut ordered)?;
    }
    Ok(ordered)
}

fn visit(
    node: &Node,
    seen: &mut HashSet<NodeId>,
    ordered: &mut Vec<Node>,
) -> Result<(), CompileError> {
    if seen.contains(&NodeId::of(node)) {
        return Ok(());
    }
    for parent in parents(node)? {
        visit(&parent, seen, ordered)?;
    }
    seen.insert(NodeId::of(node));
    ordered.push(node.clone());
    Ok(())
}

/// The parent nodes of `node`, in the order the node exposes them:
/// category-definition parents, then the chain source, then a node-valued
/// filter value, then function arguments in declared order.
fn parents(node: &Node) -> Result<Vec<Node>, CompileError> {
    let mut parents = Vec::new();
    if let QueryNode::ValueFromCategory(category) = node.as_ref() {
        parents.extend(category_parents(&category.definitions)?);
    }
    if let Some(source) = node.source() {
        parents.push(source.clone());
    }
    if let QueryNode::FilteredTable(filter) = node.as_ref() {
        if let Operand::Node(value) = &filter.value {
            parents.push(value.clone());
        }
    }
    if let QueryNode::ValueFromFunction(function) = node.as_ref() {
        for argument in &function.arguments {
            if let Operand::Node(value) = argument {
                parents.push(value.clone());
            }
        }
    }
    Ok(parents)
}

/// Collects the output-node values referenced by a set of category
/// definitions, sorted by `(column, source fingerprint)` so the join order
/// of their interim tables is stable.
///
/// Function values contribute their arguments, and nested category values
/// contribute their own definitions' parents; only output nodes land in the
/// result.
pub fn category_parents(
    definitions: &IndexMap<String, Comparator>,
) -> Result<Vec<Node>, CompileError> {
    let mut collected = Vec::new();
    let mut seen = HashSet::new();
    for comparator in definitions.values() {
        collect_comparator(comparator, &mut collected, &mut seen)?;
    }
    collected.sort_by_key(|node| (raw_column(node), fingerprint(node.source().unwrap())));
    Ok(collected)
}

fn collect_comparator(
    comparator: &Comparator,
    collected: &mut Vec<Node>,
    seen: &mut HashSet<NodeId>,
) -> Result<(), CompileError> {
    match comparator {
        Comparator::Compare { lhs, rhs, .. } => {
            collect_value(lhs, collected, seen)?;
            if let Operand::Node(value) = rhs {
                collect_value(value, collected, seen)?;
            }
            Ok(())
        }
        Comparator::Combine { lhs, rhs, .. } => {
            collect_comparator(lhs, collected, seen)?;
            collect_comparator(rhs, collected, seen)
        }
    }
}

fn collect_value(
    node: &Node,
    collected: &mut Vec<Node>,
    seen: &mut HashSet<NodeId>,
) -> Result<(), CompileError> {
    match node.as_ref() {
        QueryNode::Column(_) | QueryNode::ValueFromRow(_) | QueryNode::ValueFromAggregate(_) => {
            if seen.insert(NodeId::of(node)) {
                collected.push(node.clone());
            }
            Ok(())
        }
        QueryNode::ValueFromFunction(function) => {
            for argument in &function.arguments {
                if let Operand::Node(value) = argument {
                    collect_value(value, collected, seen)?;
                }
            }
            Ok(())
        }
        QueryNode::ValueFromCategory(category) => {
            for comparator in category.definitions.values() {
                collect_comparator(comparator, collected, seen)?;
            }
            Ok(())
        }
        other => Err(CompileError::shape(format!(
            "category definitions must reference patient-level values, found {}",
            other.describe()
        ))),
    }
}

fn raw_column(node: &Node) -> String {
    match node.as_ref() {
        QueryNode::Column(c) => c.column.clone(),
        QueryNode::ValueFromRow(v) => v.column.clone(),
        QueryNode::ValueFromAggregate(v) => v.column.clone(),
        _ => String::new(),
    }
}

/// A deterministic structural fingerprint: node kind, table name, filter
/// chain, and sort columns, canonically serialized. Used as a sort tie-break
/// where the original relied on `repr`.
pub fn fingerprint(node: &Node) -> String {
    match node.as_ref() {
        QueryNode::Table(t) => format!("table({})", t.name),
        QueryNode::FilteredTable(f) => format!(
            "filter({},{},{},{})",
            fingerprint(&f.source),
            f.column,
            f.operator.name(),
            operand_fingerprint(&f.value),
        ),
        QueryNode::Row(r) => format!(
            "row({},[{}],{})",
            fingerprint(&r.source),
            r.sort_columns.join(","),
            if r.descending { "desc" } else { "asc" },
        ),
        QueryNode::Column(c) => format!("column({},{})", fingerprint(&c.source), c.column),
        QueryNode::ValueFromRow(v) => {
            format!("value_from_row({},{})", fingerprint(&v.source), v.column)
        }
        QueryNode::ValueFromAggregate(v) => format!(
            "value_from_aggregate({},{},{})",
            fingerprint(&v.source),
            v.function,
            v.column,
        ),
        QueryNode::ValueFromCategory(c) => {
            let labels: Vec<&str> = c.definitions.keys().map(String::as_str).collect();
            format!("category([{}])", labels.join(","))
        }
        QueryNode::ValueFromFunction(f) => {
            let args: Vec<String> = f.arguments.iter().map(operand_fingerprint).collect();
            format!("function({},[{}])", f.kind.name(), args.join(","))
        }
        QueryNode::Codelist(c) => format!("codelist({},{})", c.system, c.codes.len()),
    }
}

fn operand_fingerprint(operand: &Operand) -> String {
    match operand {
        Operand::Literal(literal) => format!("{literal:?}"),
        Operand::Node(node) => fingerprint(node),
    }
}

/// An output group's source chain, linearized.
#[derive(Debug)]
pub struct Chain {
    pub table: Node,
    pub filters: Vec<Node>,
    pub row: Option<Node>,
}

/// Linearizes a chain by following `source` links until a `Table` is
/// reached, and checks the shape `Table -> Filter* -> Row?`.
pub fn linearize(source: &Node) -> Result<Chain, CompileError> {
    let mut reversed = Vec::new();
    let mut current = source.clone();
    loop {
        match current.as_ref() {
            QueryNode::Table(_) => {
                reversed.push(current.clone());
                break;
            }
            QueryNode::FilteredTable(_) | QueryNode::Row(_) => {
                reversed.push(current.clone());
                let next = current.source().unwrap().clone();
                current = next;
            }
            other => {
                return Err(CompileError::shape(format!(
                    "expected a table chain, found {}",
                    other.describe()
                )))
            }
        }
    }
    reversed.reverse();
    let mut nodes = reversed.into_iter();

    let table = nodes.next().unwrap();
    let mut filters = Vec::new();
    let mut row = None;
    for node in nodes {
        match node.as_ref() {
            QueryNode::FilteredTable(_) => {
                if row.is_some() {
                    return Err(CompileError::shape(
                        "filters cannot be applied after a row picker".to_string(),
                    ));
                }
                filters.push(node);
            }
            QueryNode::Row(_) => {
                if row.is_some() {
                    return Err(CompileError::shape(
                        "only one row picker may appear in a chain".to_string(),
                    ));
                }
                row = Some(node);
            }
            _ => unreachable!("linearized chains only contain filters and row pickers"),
        }
    }

    Ok(Chain {
        table,
        filters,
        row,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{categorise, ge, lt, table, FilterOp, OutputKind};

    fn definitions(pairs: Vec<(&str, Node)>) -> IndexMap<String, Node> {
        pairs
            .into_iter()
            .map(|(name, node)| (name.to_string(), node))
            .collect()
    }

    #[test]
    fn topological_order_puts_parents_first() {
        let events = table("clinical_events").filter("code", FilterOp::Equals, "abc");
        let count = events.count("code");
        let dag = analyze(&definitions(vec![("n", count.clone())])).unwrap();

        let positions: Vec<String> = dag
            .nodes
            .iter()
            .map(|n| n.describe())
            .collect();
        assert_eq!(positions.len(), 3);
        assert!(positions[0].starts_with("table"));
        assert!(positions[1].starts_with("filter"));
        assert!(positions[2].starts_with("aggregate"));
    }

    #[test]
    fn outputs_sharing_kind_and_source_share_a_group() {
        let row = table("patients").latest(&["date_of_birth"]);
        let sex = row.get("sex");
        let dob = row.get("date_of_birth");
        let dag = analyze(&definitions(vec![("sex", sex), ("dob", dob)])).unwrap();

        assert_eq!(dag.groups.len(), 1);
        let group = dag.groups.values().next().unwrap();
        assert_eq!(group.outputs.len(), 2);
    }

    #[test]
    fn differing_kinds_split_groups() {
        let events = table("clinical_events").filter("code", FilterOp::Equals, "abc");
        let count = events.count("code");
        let values = events.get("value");
        let dag = analyze(&definitions(vec![("n", count), ("vals", values)])).unwrap();

        assert_eq!(dag.groups.len(), 2);
        let kinds: Vec<OutputKind> = dag.groups.keys().map(|k| k.kind).collect();
        assert_eq!(
            kinds,
            vec![OutputKind::ValueFromAggregate, OutputKind::Column]
        );
    }

    #[test]
    fn codelists_are_collected_once_in_first_appearance_order() {
        let cl = crate::query::codelist(vec!["abc", "def"], "snomed");
        let first = table("clinical_events")
            .filter("code", FilterOp::IsIn, &cl)
            .exists();
        let second = table("clinical_events")
            .filter("code", FilterOp::IsIn, &cl)
            .count("code");
        let dag = analyze(&definitions(vec![("a", first), ("b", second)])).unwrap();

        assert_eq!(dag.codelists.len(), 1);
    }

    #[test]
    fn category_parents_are_sorted_and_deduplicated() {
        let height = table("patients").latest(&[]).get("height");
        let weight = table("patients").latest(&[]).get("weight");
        let defs: IndexMap<String, Comparator> = vec![
            ("tall".to_string(), ge(&height, 190)),
            ("light".to_string(), lt(&weight, 60).and(lt(&height, 190))),
        ]
        .into_iter()
        .collect();

        let parents = category_parents(&defs).unwrap();
        let columns: Vec<String> = parents.iter().map(raw_column).collect();
        assert_eq!(columns, vec!["height", "weight"]);
    }

    #[test]
    fn category_over_event_level_source_is_a_shape_error() {
        let raw_column_node = table("clinical_events").get("value");
        let bad = categorise(
            vec![("high", ge(&raw_column_node, 100))],
            "low",
        );
        // A Column is an output node, so this is accepted...
        assert!(analyze(&definitions(vec![("c", bad)])).is_ok());

        // ...but a bare table chain is not.
        let chain = table("clinical_events")
            .filter("code", FilterOp::Equals, "abc")
            .node();
        let bad = categorise(vec![("has", ge(&chain, 1))], "none");
        let err = analyze(&definitions(vec![("c", bad)])).unwrap_err();
        assert!(matches!(err, CompileError::Shape(_)));
    }

    #[test]
    fn linearize_checks_chain_shape() {
        let picked = table("patients")
            .filter("sex", FilterOp::Equals, "F")
            .latest(&["date_of_birth"]);
        let chain = linearize(&picked.node()).unwrap();
        assert!(matches!(chain.table.as_ref(), QueryNode::Table(_)));
        assert_eq!(chain.filters.len(), 1);
        assert!(chain.row.is_some());

        let err = linearize(&table("patients").latest(&[]).get("sex")).unwrap_err();
        assert!(matches!(err, CompileError::Shape(_)));
    }
}
