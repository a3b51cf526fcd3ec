//! Semantic validation: eight ordered passes over a parsed declaration.
//!
//! Each pass collects every issue in its category, then fails before the next
//! pass runs (fail-fast per category). Unknown identifiers get a "did you
//! mean" suggestion when a known identifier is within edit distance 2.
//!
//! Pass order:
//! 1. edge endpoints resolve to node ids or `START`/`END`
//! 2. node `outputs` entries name existing state fields
//! 3. `output_schema` field set equals the `outputs` set
//! 4. output types match their state field types
//! 5. `{path}` placeholders and input bindings resolve
//! 6. all type descriptors parse
//! 7. linear-only shape (one outgoing edge per node, no routes, no cycles)
//! 8. reachability: `START` reaches every node, every node reaches `END`
//!
//! A shape pass runs first: schema version, flow name, node count, id
//! uniqueness and grammar, and the single-`START`-edge rule.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::{EngineError, ValidationIssue, ValidationReport};
use crate::schema::{is_identifier, Declaration, EdgeSpec, END, SCHEMA_VERSION, START};
use crate::suggest::closest;
use crate::template::placeholders;
use crate::typesys::TypeRef;

/// Runs all passes. The returned error carries every issue from the first
/// failing pass.
pub fn validate(decl: &Declaration) -> Result<(), EngineError> {
    shape(decl)?;
    edge_endpoints(decl)?;
    outputs_exist(decl)?;
    output_schema_alignment(decl)?;
    output_types_match(decl)?;
    placeholders_resolve(decl)?;
    typerefs_parse(decl)?;
    linear_only(decl)?;
    reachability(decl)?;
    Ok(())
}

fn fail_if(issues: Vec<ValidationIssue>) -> Result<(), EngineError> {
    if issues.is_empty() {
        Ok(())
    } else {
        Err(EngineError::ConfigValidation(ValidationReport { issues }))
    }
}

fn node_ids(decl: &Declaration) -> Vec<&str> {
    decl.nodes.iter().map(|n| n.id.as_str()).collect()
}

fn shape(decl: &Declaration) -> Result<(), EngineError> {
    let mut issues = Vec::new();
    if decl.schema_version != SCHEMA_VERSION {
        issues.push(ValidationIssue::new(
            "schema_version",
            format!(
                "unsupported version `{}` (this engine accepts `{}`)",
                decl.schema_version, SCHEMA_VERSION
            ),
        ));
    }
    if decl.flow.name.trim().is_empty() {
        issues.push(ValidationIssue::new("flow.name", "must not be empty"));
    }
    if decl.nodes.is_empty() {
        issues.push(ValidationIssue::new("nodes", "at least one node is required"));
    }
    let mut seen = HashSet::new();
    for (i, node) in decl.nodes.iter().enumerate() {
        if !is_identifier(&node.id) {
            issues.push(ValidationIssue::new(
                format!("nodes[{}].id", i),
                format!("`{}` is not a valid identifier", node.id),
            ));
        }
        if !seen.insert(node.id.as_str()) {
            issues.push(ValidationIssue::new(
                format!("nodes[{}].id", i),
                format!("duplicate node id `{}`", node.id),
            ));
        }
    }
    for (name, field) in &decl.state.fields {
        if field.required && field.default.is_some() {
            issues.push(ValidationIssue::new(
                format!("state.fields.{}", name),
                "`required` and `default` are mutually exclusive",
            ));
        }
    }
    let start_edges = decl.edges.iter().filter(|e| e.from == START).count();
    if start_edges != 1 {
        issues.push(ValidationIssue::new(
            "edges",
            format!("exactly one edge must originate at START (found {})", start_edges),
        ));
    }
    fail_if(issues)
}

fn edge_endpoints(decl: &Declaration) -> Result<(), EngineError> {
    fn check(
        issues: &mut Vec<ValidationIssue>,
        ids: &[&str],
        path: String,
        name: &str,
        allow: &str,
    ) {
        if name == allow || ids.contains(&name) {
            return;
        }
        let candidates = ids.iter().copied().chain(std::iter::once(allow));
        issues.push(
            ValidationIssue::new(path, format!("unknown node `{}`", name))
                .with_suggestion(closest(name, candidates)),
        );
    }

    let ids = node_ids(decl);
    let mut issues = Vec::new();
    for (i, edge) in decl.edges.iter().enumerate() {
        check(&mut issues, &ids, format!("edges[{}].from", i), &edge.from, START);
        match (&edge.to, &edge.routes) {
            (Some(to), None) => check(&mut issues, &ids, format!("edges[{}].to", i), to, END),
            (None, Some(routes)) => {
                for (j, route) in routes.iter().enumerate() {
                    check(
                        &mut issues,
                        &ids,
                        format!("edges[{}].routes[{}].to", i, j),
                        &route.to,
                        END,
                    );
                }
            }
            (Some(_), Some(_)) => issues.push(ValidationIssue::new(
                format!("edges[{}]", i),
                "an edge takes either `to` or `routes`, not both",
            )),
            (None, None) => issues.push(ValidationIssue::new(
                format!("edges[{}]", i),
                "an edge requires `to` or `routes`",
            )),
        }
    }
    fail_if(issues)
}

fn outputs_exist(decl: &Declaration) -> Result<(), EngineError> {
    let fields: Vec<&str> = decl.state.fields.keys().map(|s| s.as_str()).collect();
    let mut issues = Vec::new();
    for (i, node) in decl.nodes.iter().enumerate() {
        for (j, output) in node.outputs.iter().enumerate() {
            if !fields.contains(&output.as_str()) {
                issues.push(
                    ValidationIssue::new(
                        format!("nodes[{}].outputs[{}]", i, j),
                        format!("`{}` is not a state field", output),
                    )
                    .with_suggestion(closest(output, fields.iter().copied())),
                );
            }
        }
    }
    fail_if(issues)
}

fn output_schema_alignment(decl: &Declaration) -> Result<(), EngineError> {
    let mut issues = Vec::new();
    for (i, node) in decl.nodes.iter().enumerate() {
        let Some(schema) = &node.output_schema else {
            continue;
        };
        let declared: HashSet<&str> = schema.keys().map(|s| s.as_str()).collect();
        let outputs: HashSet<&str> = node.outputs.iter().map(|s| s.as_str()).collect();
        for extra in declared.difference(&outputs) {
            issues.push(ValidationIssue::new(
                format!("nodes[{}].output_schema.{}", i, extra),
                format!("`{}` is not in this node's outputs", extra),
            ));
        }
        for missing in outputs.difference(&declared) {
            issues.push(ValidationIssue::new(
                format!("nodes[{}].output_schema", i),
                format!("output `{}` has no schema entry", missing),
            ));
        }
    }
    fail_if(issues)
}

/// Compares parseable types only; descriptors that fail to parse are pass 6's
/// business.
fn output_types_match(decl: &Declaration) -> Result<(), EngineError> {
    let state_types: BTreeMap<&str, TypeRef> = decl
        .state
        .fields
        .iter()
        .filter_map(|(name, field)| field.resolve().ok().map(|ty| (name.as_str(), ty)))
        .collect();
    let mut issues = Vec::new();
    for (i, node) in decl.nodes.iter().enumerate() {
        let Some(schema) = &node.output_schema else {
            continue;
        };
        for (name, type_decl) in schema {
            let (Some(expected), Ok(declared)) = (state_types.get(name.as_str()), type_decl.resolve())
            else {
                continue;
            };
            if *expected != declared {
                issues.push(ValidationIssue::new(
                    format!("nodes[{}].output_schema.{}", i, name),
                    format!(
                        "type `{}` does not match state field type `{}`",
                        declared, expected
                    ),
                ));
            }
        }
    }
    fail_if(issues)
}

/// Walks a dotted path from a state field, descending `Object` fields. Paths
/// into non-object types (or unparseable ones) stop at the root — the root
/// existing is what this pass guarantees.
fn path_resolves(path: &str, decl: &Declaration, locals: &[&str]) -> bool {
    let mut segments = path.split('.');
    let Some(root) = segments.next() else {
        return false;
    };
    if locals.contains(&root) {
        return true;
    }
    let Some(field) = decl.state.fields.get(root) else {
        return false;
    };
    let Ok(root_ty) = field.resolve() else {
        return true;
    };
    let mut ty = &root_ty;
    for segment in segments {
        match ty {
            TypeRef::Object { fields } => match fields.get(segment) {
                Some(next) => ty = next,
                None => return false,
            },
            _ => return true,
        }
    }
    true
}

fn placeholders_resolve(decl: &Declaration) -> Result<(), EngineError> {
    let mut issues = Vec::new();
    for (i, node) in decl.nodes.iter().enumerate() {
        let locals: Vec<&str> = node.inputs.keys().map(|s| s.as_str()).collect();
        let known = || {
            locals
                .iter()
                .copied()
                .chain(decl.state.fields.keys().map(|s| s.as_str()))
        };
        let templates = [
            (format!("nodes[{}].prompt", i), Some(&node.prompt)),
            (format!("nodes[{}].system", i), node.system.as_ref()),
        ];
        for (path, template) in templates {
            let Some(template) = template else { continue };
            for placeholder in placeholders(template) {
                if !path_resolves(&placeholder, decl, &locals) {
                    let root = placeholder.split('.').next().unwrap_or(&placeholder);
                    issues.push(
                        ValidationIssue::new(
                            path.clone(),
                            format!("placeholder `{{{}}}` does not resolve", placeholder),
                        )
                        .with_suggestion(closest(root, known())),
                    );
                }
            }
        }
        for (name, path) in &node.inputs {
            if !path_resolves(path, decl, &[]) {
                let root = path.split('.').next().unwrap_or(path);
                issues.push(
                    ValidationIssue::new(
                        format!("nodes[{}].inputs.{}", i, name),
                        format!("path `{}` does not resolve to a state field", path),
                    )
                    .with_suggestion(closest(root, decl.state.fields.keys().map(|s| s.as_str()))),
                );
            }
        }
    }
    fail_if(issues)
}

fn typerefs_parse(decl: &Declaration) -> Result<(), EngineError> {
    let mut issues = Vec::new();
    for (name, field) in &decl.state.fields {
        if let Err(e) = field.resolve() {
            issues.push(ValidationIssue::new(format!("state.fields.{}.type", name), e));
        }
    }
    for (i, node) in decl.nodes.iter().enumerate() {
        if let Some(schema) = &node.output_schema {
            for (name, type_decl) in schema {
                if let Err(e) = type_decl.resolve() {
                    issues.push(ValidationIssue::new(
                        format!("nodes[{}].output_schema.{}.type", i, name),
                        e,
                    ));
                }
            }
        }
    }
    fail_if(issues)
}

fn linear_edges(decl: &Declaration) -> impl Iterator<Item = (&str, &str)> {
    decl.edges.iter().filter_map(|e: &EdgeSpec| {
        e.to.as_deref().map(|to| (e.from.as_str(), to))
    })
}

fn linear_only(decl: &Declaration) -> Result<(), EngineError> {
    let mut issues = Vec::new();
    for (i, edge) in decl.edges.iter().enumerate() {
        if edge.routes.is_some() {
            issues.push(ValidationIssue::new(
                format!("edges[{}]", i),
                "conditional routes are not available in v1.0 (linear graphs only)",
            ));
        }
    }
    let mut outgoing: HashMap<&str, usize> = HashMap::new();
    for (from, _) in linear_edges(decl) {
        if from != START {
            *outgoing.entry(from).or_default() += 1;
        }
    }
    for (from, count) in &outgoing {
        if *count > 1 {
            issues.push(ValidationIssue::new(
                "edges",
                format!("node `{}` has {} outgoing edges (linear graphs allow one)", from, count),
            ));
        }
    }
    if !issues.is_empty() {
        return fail_if(issues);
    }

    // Walk the single chain; revisiting a node means a cycle.
    let next: HashMap<&str, &str> = linear_edges(decl).collect();
    let mut current = next.get(START).copied();
    let mut visited = HashSet::new();
    while let Some(node) = current {
        if node == END {
            break;
        }
        if !visited.insert(node) {
            issues.push(ValidationIssue::new(
                "edges",
                format!("cycle detected through node `{}`", node),
            ));
            break;
        }
        current = next.get(node).copied();
    }
    fail_if(issues)
}

fn reachability(decl: &Declaration) -> Result<(), EngineError> {
    let mut forward: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in linear_edges(decl) {
        forward.entry(from).or_default().push(to);
        reverse.entry(to).or_default().push(from);
    }

    let bfs = |adjacency: &HashMap<&str, Vec<&str>>, origin: &str| -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([origin.to_string()]);
        while let Some(current) = queue.pop_front() {
            for &next in adjacency.get(current.as_str()).into_iter().flatten() {
                if seen.insert(next.to_string()) {
                    queue.push_back(next.to_string());
                }
            }
        }
        seen
    };

    let from_start = bfs(&forward, START);
    let to_end = bfs(&reverse, END);
    let mut issues = Vec::new();
    for node in &decl.nodes {
        if !from_start.contains(&node.id) {
            issues.push(ValidationIssue::new(
                "edges",
                format!("node `{}` is not reachable from START", node.id),
            ));
        }
        if !to_end.contains(&node.id) {
            issues.push(ValidationIssue::new(
                "edges",
                format!("node `{}` does not reach END", node.id),
            ));
        }
    }
    fail_if(issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Declaration;

    fn two_node() -> Declaration {
        Declaration::from_yaml_str(
            r#"
schema_version: "1.0"
flow:
  name: research-write
state:
  fields:
    topic: { type: str, required: true }
    research: { type: str }
    article: { type: str }
nodes:
  - id: research
    prompt: "Research {topic}"
    outputs: [research]
    output_schema:
      research: { type: str }
  - id: write
    prompt: "Write an article from {research}"
    outputs: [article]
edges:
  - { from: START, to: research }
  - { from: research, to: write }
  - { from: write, to: END }
"#,
        )
        .unwrap()
    }

    fn issues(err: EngineError) -> Vec<String> {
        match err {
            EngineError::ConfigValidation(report) => {
                report.issues.into_iter().map(|i| i.to_string()).collect()
            }
            other => panic!("expected ConfigValidation, got {:?}", other),
        }
    }

    #[test]
    fn valid_declaration_passes() {
        validate(&two_node()).unwrap();
    }

    #[test]
    fn unknown_edge_endpoint_suggests_closest() {
        let mut decl = two_node();
        decl.edges[1].to = Some("wrte".to_string());
        let msgs = issues(validate(&decl).unwrap_err());
        assert_eq!(msgs.len(), 1, "{:?}", msgs);
        assert!(msgs[0].contains("unknown node `wrte`"), "{:?}", msgs);
        assert!(msgs[0].contains("did you mean `write`"), "{:?}", msgs);
    }

    #[test]
    fn unknown_output_field_suggests_closest() {
        let mut decl = two_node();
        decl.nodes[1].outputs = vec!["artcle".to_string()];
        let msgs = issues(validate(&decl).unwrap_err());
        assert!(msgs[0].contains("`artcle` is not a state field"), "{:?}", msgs);
        assert!(msgs[0].contains("did you mean `article`"), "{:?}", msgs);
    }

    #[test]
    fn output_schema_must_align_with_outputs() {
        let mut decl = two_node();
        let schema = decl.nodes[0].output_schema.as_mut().unwrap();
        schema.insert(
            "extra".to_string(),
            crate::schema::TypeDecl {
                type_decl: "str".into(),
                schema: None,
            },
        );
        let msgs = issues(validate(&decl).unwrap_err());
        assert!(msgs[0].contains("`extra` is not in this node's outputs"), "{:?}", msgs);
    }

    #[test]
    fn output_type_must_match_state_field() {
        let mut decl = two_node();
        decl.nodes[0]
            .output_schema
            .as_mut()
            .unwrap()
            .get_mut("research")
            .unwrap()
            .type_decl = "int".into();
        let msgs = issues(validate(&decl).unwrap_err());
        assert!(
            msgs[0].contains("type `int` does not match state field type `str`"),
            "{:?}",
            msgs
        );
    }

    #[test]
    fn unresolved_placeholder_fails_with_suggestion() {
        let mut decl = two_node();
        decl.nodes[0].prompt = "Research {topik}".to_string();
        let msgs = issues(validate(&decl).unwrap_err());
        assert!(msgs[0].contains("placeholder `{topik}` does not resolve"), "{:?}", msgs);
        assert!(msgs[0].contains("did you mean `topic`"), "{:?}", msgs);
    }

    #[test]
    fn dotted_placeholder_into_object_field() {
        let mut decl = Declaration::from_yaml_str(
            r#"
schema_version: "1.0"
flow: { name: dotted }
state:
  fields:
    profile:
      type: object
      required: true
      schema:
        name: { type: str }
    summary: { type: str }
nodes:
  - id: summarize
    prompt: "Summarize {profile.name}"
    outputs: [summary]
edges:
  - { from: START, to: summarize }
  - { from: summarize, to: END }
"#,
        )
        .unwrap();
        validate(&decl).unwrap();

        decl.nodes[0].prompt = "Summarize {profile.nmae}".to_string();
        let msgs = issues(validate(&decl).unwrap_err());
        assert!(msgs[0].contains("{profile.nmae}"), "{:?}", msgs);
    }

    #[test]
    fn bad_type_descriptor_fails_pass_six() {
        let mut decl = two_node();
        decl.state
            .fields
            .get_mut("article")
            .unwrap()
            .type_decl = "lst[str]".into();
        // Pass 2 still sees the field name, so the failure comes from pass 6.
        let msgs = issues(validate(&decl).unwrap_err());
        assert!(msgs[0].contains("state.fields.article.type"), "{:?}", msgs);
    }

    #[test]
    fn conditional_routes_rejected_in_v1() {
        let mut decl = two_node();
        decl.edges[1].to = None;
        decl.edges[1].routes = Some(vec![crate::schema::RouteSpec {
            condition: "always".into(),
            to: "write".into(),
        }]);
        let msgs = issues(validate(&decl).unwrap_err());
        assert!(msgs[0].contains("linear graphs only"), "{:?}", msgs);
    }

    #[test]
    fn cycle_detected() {
        let mut decl = two_node();
        decl.edges[2].to = Some("research".to_string());
        let msgs = issues(validate(&decl).unwrap_err());
        assert!(msgs.iter().any(|m| m.contains("cycle detected")), "{:?}", msgs);
    }

    #[test]
    fn unreachable_node_detected() {
        let mut decl = two_node();
        // Point the chain straight at write; research keeps its edge to write
        // but nothing leads into it.
        decl.edges[0].to = Some("write".to_string());
        let msgs = issues(validate(&decl).unwrap_err());
        assert!(
            msgs[0].contains("`research` is not reachable from START"),
            "{:?}",
            msgs
        );
    }

    #[test]
    fn duplicate_node_id_fails_shape_pass() {
        let mut decl = two_node();
        decl.nodes[1].id = "research".to_string();
        let msgs = issues(validate(&decl).unwrap_err());
        assert!(msgs[0].contains("duplicate node id `research`"), "{:?}", msgs);
    }

    #[test]
    fn required_and_default_are_exclusive() {
        let mut decl = two_node();
        let field = decl.state.fields.get_mut("topic").unwrap();
        field.default = Some(serde_json::json!("news"));
        let msgs = issues(validate(&decl).unwrap_err());
        assert!(msgs[0].contains("mutually exclusive"), "{:?}", msgs);
    }
}
