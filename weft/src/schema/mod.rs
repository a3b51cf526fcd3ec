//! Declaration schema: typed models for the workflow document.
//!
//! A declaration loads from YAML or JSON into [`Declaration`]; unknown fields
//! are rejected and enumerations are closed. Structural errors surface as
//! [`EngineError::ConfigParse`] with the location the deserializer reports.
//! Semantic rules (cross-references, graph shape) live in [`validate`].
//!
//! Declarations are immutable once parsed; the engine keeps the exact source
//! alongside the parsed form for run snapshots.

pub mod validate;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::gates::GateSpec;
use crate::typesys::{parse_type, TypeRef};

/// Sentinel for graph entry: edges originate here exactly once.
pub const START: &str = "START";

/// Sentinel for graph exit.
pub const END: &str = "END";

/// The only schema version this engine accepts.
pub const SCHEMA_VERSION: &str = "1.0";

/// A parsed workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Declaration {
    pub schema_version: String,
    pub flow: FlowMeta,
    pub state: StateDecl,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<EngineConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization: Option<OptimizationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// The typed shared state: field name → spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateDecl {
    pub fields: BTreeMap<String, FieldSpec>,
}

/// One state field. `required` and `default` are mutually exclusive (checked
/// during validation, not deserialization).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub type_decl: String,
    /// Field layout when `type` is `object`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<BTreeMap<String, TypeDecl>>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSpec {
    /// Resolves the surface descriptor (plus optional object schema) into a
    /// canonical TypeRef. A schema-less `object` is rejected here — the type
    /// parser itself accepts the word.
    pub fn resolve(&self) -> Result<TypeRef, String> {
        resolve_decl(&self.type_decl, self.schema.as_ref())
    }
}

/// A bare type descriptor with an optional nested object schema. Used for
/// output schemas and for the fields of an `object` state field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeDecl {
    #[serde(rename = "type")]
    pub type_decl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<BTreeMap<String, TypeDecl>>,
}

impl TypeDecl {
    pub fn resolve(&self) -> Result<TypeRef, String> {
        resolve_decl(&self.type_decl, self.schema.as_ref())
    }
}

fn resolve_decl(
    descriptor: &str,
    schema: Option<&BTreeMap<String, TypeDecl>>,
) -> Result<TypeRef, String> {
    let ty = parse_type(descriptor).map_err(|e| e.to_string())?;
    match ty {
        TypeRef::Object { .. } => {
            let Some(schema) = schema else {
                return Err("`object` requires an accompanying `schema`".to_string());
            };
            let mut fields = BTreeMap::new();
            for (name, decl) in schema {
                fields.insert(name.clone(), decl.resolve()?);
            }
            Ok(TypeRef::Object { fields })
        }
        other => {
            if schema.is_some() {
                return Err(format!("`schema` is only valid with type `object`, not `{}`", descriptor));
            }
            Ok(other)
        }
    }
}

/// One processing node: a prompt template, a model selection, optional tools,
/// and the state fields it writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub id: String,
    pub prompt: String,
    /// Optional system message; templated like the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Local input bindings: name → dotted path into run inputs + state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<BTreeMap<String, TypeDecl>>,
    /// Retries after the first attempt on recoverable LLM/type errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    /// Whole-node timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Model selection. All fields optional so the same shape serves as
/// `config.llm_defaults`; a node's entries win over the defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Per-LLM-call timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// An edge: linear (`to`) or conditional (`routes`). v1.0 accepts only linear
/// edges — `routes` parses but is rejected by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeSpec {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteSpec>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    pub condition: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_defaults: Option<LlmRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_defaults: Option<ExecutionDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    /// Default whole-node timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_runs: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// When set, each finished run appends one JSON line here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_test: Option<AbTestConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<GateSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AbTestConfig {
    pub experiment_name: String,
    pub run_count: u32,
    pub variants: Vec<VariantSpec>,
}

/// A variant overrides one node's prompt; the unit of A/B comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantSpec {
    pub name: String,
    pub prompt: String,
    pub node_id: String,
}

impl Declaration {
    pub fn from_yaml_str(source: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(source).map_err(|e| EngineError::ConfigParse(e.to_string()))
    }

    pub fn from_json_str(source: &str) -> Result<Self, EngineError> {
        serde_json::from_str(source).map_err(|e| EngineError::ConfigParse(e.to_string()))
    }

    /// Loads a declaration by file extension (`.yaml`/`.yml`/`.json`).
    pub fn load(path: &Path) -> Result<(Self, String), EngineError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| EngineError::ConfigParse(format!("read {}: {}", path.display(), e)))?;
        let decl = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&source)?,
            Some("yaml") | Some("yml") => Self::from_yaml_str(&source)?,
            other => {
                return Err(EngineError::ConfigParse(format!(
                    "unsupported declaration extension {:?} (use .yaml, .yml, or .json)",
                    other.unwrap_or("")
                )))
            }
        };
        Ok((decl, source))
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Gates declared under `optimization.gates` (empty slice when absent).
    pub fn gates(&self) -> &[GateSpec] {
        self.optimization
            .as_ref()
            .map(|o| o.gates.as_slice())
            .unwrap_or(&[])
    }
}

/// Identifier grammar for node ids and field names: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
schema_version: "1.0"
flow:
  name: echo
state:
  fields:
    message:
      type: str
      required: true
    result:
      type: str
nodes:
  - id: echo
    prompt: "Echo: {message}"
    outputs: [result]
edges:
  - { from: START, to: echo }
  - { from: echo, to: END }
"#;

    #[test]
    fn minimal_yaml_parses() {
        let decl = Declaration::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(decl.flow.name, "echo");
        assert_eq!(decl.nodes.len(), 1);
        assert_eq!(decl.nodes[0].outputs, vec!["result"]);
        assert_eq!(decl.edges[0].from, START);
        assert_eq!(decl.edges[1].to.as_deref(), Some(END));
    }

    #[test]
    fn unknown_fields_rejected() {
        let bad = MINIMAL.replace("flow:", "floow: {}\nflow:");
        let err = Declaration::from_yaml_str(&bad).unwrap_err();
        assert!(matches!(err, EngineError::ConfigParse(_)), "{:?}", err);
    }

    #[test]
    fn json_round_trips_through_snapshot() {
        let decl = Declaration::from_yaml_str(MINIMAL).unwrap();
        let snapshot = serde_json::to_string(&decl).unwrap();
        let back = Declaration::from_json_str(&snapshot).unwrap();
        assert_eq!(decl, back);
    }

    #[test]
    fn object_field_requires_schema() {
        let spec = FieldSpec {
            type_decl: "object".into(),
            schema: None,
            required: false,
            default: None,
            description: None,
        };
        let err = spec.resolve().unwrap_err();
        assert!(err.contains("requires an accompanying `schema`"), "{}", err);
    }

    #[test]
    fn object_field_resolves_nested_schema() {
        let yaml = r#"
type: object
schema:
  title: { type: str }
  points: { type: "list[int]" }
"#;
        let spec: FieldSpec = serde_yaml::from_str(yaml).unwrap();
        let ty = spec.resolve().unwrap();
        assert_eq!(ty.to_string(), "object{points:list[int],title:str}");
    }

    #[test]
    fn schema_on_non_object_rejected() {
        let yaml = r#"
type: str
schema:
  x: { type: int }
"#;
        let spec: FieldSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(spec.resolve().is_err());
    }

    #[test]
    fn identifier_grammar() {
        assert!(is_identifier("node_1"));
        assert!(is_identifier("_x"));
        assert!(!is_identifier("1node"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn conditional_routes_parse_structurally() {
        let yaml = r#"
from: router
routes:
  - { condition: "state.kind == 'a'", to: handle_a }
"#;
        let edge: EdgeSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(edge.routes.as_ref().unwrap()[0].to, "handle_a");
    }
}
