//! Runtime state and output models synthesized from a validated declaration.
//!
//! No code generation: state travels as a tagged map keyed by field name and
//! every value is checked through the TypeRef tree. [`StateModel`] is the
//! `{field, type, required, default}` table emitted at plan-build time;
//! [`OutputModel`] validates one node's structured output before it is merged.
//! Both are cheap to clone and reusable across runs of the same declaration.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::error::EngineError;
use crate::schema::{NodeSpec, StateDecl};
use crate::typesys::{validate_value, BasicType, TypeRef};

/// The live shared state of a run: field name → value.
pub type State = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
pub struct StateField {
    pub name: String,
    pub ty: TypeRef,
    pub required: bool,
    pub default: Option<Value>,
}

/// Field table for a declaration's state.
#[derive(Debug, Clone)]
pub struct StateModel {
    fields: Vec<StateField>,
}

impl StateModel {
    /// Resolves every field's type descriptor and checks declared defaults
    /// against their own types.
    pub fn from_decl(decl: &StateDecl) -> Result<Self, EngineError> {
        let mut fields = Vec::with_capacity(decl.fields.len());
        for (name, spec) in &decl.fields {
            let ty = spec
                .resolve()
                .map_err(|e| EngineError::validation(format!("state.fields.{}.type", name), e))?;
            if let Some(default) = &spec.default {
                validate_value(default, &ty).map_err(|e| EngineError::TypeValidation {
                    path: format!("state.fields.{}.default{}", name, e.path),
                    message: format!("expected {}, got {}", e.expected, e.got),
                })?;
            }
            fields.push(StateField {
                name: name.clone(),
                ty,
                required: spec.required,
                default: spec.default.clone(),
            });
        }
        Ok(Self { fields })
    }

    pub fn field(&self, name: &str) -> Option<&StateField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[StateField] {
        &self.fields
    }

    /// Builds the initial state: required fields come from `inputs` (type
    /// checked), defaults fill the rest, optional fields without a value stay
    /// absent. Input keys that are not state fields are left to the template
    /// layer and do not enter the state.
    pub fn make_state(&self, inputs: &BTreeMap<String, Value>) -> Result<State, EngineError> {
        let mut state = State::new();
        for field in &self.fields {
            match inputs.get(&field.name) {
                Some(value) => {
                    validate_value(value, &field.ty).map_err(|e| EngineError::TypeValidation {
                        path: format!("inputs.{}{}", field.name, e.path),
                        message: format!("expected {}, got {}", e.expected, e.got),
                    })?;
                    state.insert(field.name.clone(), value.clone());
                }
                None => {
                    if let Some(default) = &field.default {
                        state.insert(field.name.clone(), default.clone());
                    } else if field.required {
                        return Err(EngineError::TypeValidation {
                            path: format!("inputs.{}", field.name),
                            message: "required input is missing".to_string(),
                        });
                    }
                }
            }
        }
        Ok(state)
    }
}

/// Validator for one node's output: field name → expected type. Built from
/// the node's `output_schema` when declared, otherwise from the state field
/// types of its `outputs`.
#[derive(Debug, Clone)]
pub struct OutputModel {
    node_id: String,
    fields: Vec<(String, TypeRef)>,
}

impl OutputModel {
    pub fn from_node(node: &NodeSpec, state_model: &StateModel) -> Result<Self, EngineError> {
        let mut fields = Vec::with_capacity(node.outputs.len());
        for output in &node.outputs {
            let ty = match node.output_schema.as_ref().and_then(|s| s.get(output)) {
                Some(decl) => decl.resolve().map_err(|e| {
                    EngineError::validation(
                        format!("nodes.{}.output_schema.{}", node.id, output),
                        e,
                    )
                })?,
                None => {
                    state_model
                        .field(output)
                        .ok_or_else(|| {
                            EngineError::validation(
                                format!("nodes.{}.outputs", node.id),
                                format!("`{}` is not a state field", output),
                            )
                        })?
                        .ty
                        .clone()
                }
            };
            fields.push((output.clone(), ty));
        }
        Ok(Self {
            node_id: node.id.clone(),
            fields,
        })
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// Checks an LLM reply against the expected fields and returns the
    /// validated output map. A single-field model accepts a bare scalar and
    /// binds it to that field; multi-field models require an object. Extra
    /// keys in the reply are dropped — the declared fields are the contract.
    pub fn validate_output(&self, value: &Value) -> Result<BTreeMap<String, Value>, EngineError> {
        let mut out = BTreeMap::new();
        match (value, self.fields.as_slice()) {
            (Value::Object(map), _) => {
                for (name, ty) in &self.fields {
                    let field_value = map.get(name).ok_or_else(|| EngineError::TypeValidation {
                        path: format!("{}.{}", self.node_id, name),
                        message: "output field is missing".to_string(),
                    })?;
                    self.check(name, field_value, ty)?;
                    out.insert(name.clone(), field_value.clone());
                }
            }
            (scalar, [(name, ty)]) => {
                self.check(name, scalar, ty)?;
                out.insert(name.clone(), scalar.clone());
            }
            (other, _) => {
                return Err(EngineError::TypeValidation {
                    path: self.node_id.clone(),
                    message: format!(
                        "expected an object with fields [{}], got {}",
                        self.fields
                            .iter()
                            .map(|(n, _)| n.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                        match other {
                            Value::Array(_) => "a list",
                            Value::Null => "null",
                            _ => "a scalar",
                        }
                    ),
                })
            }
        }
        Ok(out)
    }

    fn check(&self, name: &str, value: &Value, ty: &TypeRef) -> Result<(), EngineError> {
        validate_value(value, ty).map_err(|e| EngineError::TypeValidation {
            path: format!("{}.{}{}", self.node_id, name, e.path),
            message: format!("expected {}, got {}", e.expected, e.got),
        })
    }

    /// JSON Schema for the expected output object; sent to providers as the
    /// structured-output contract and quoted in retry hints.
    pub fn json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for (name, ty) in &self.fields {
            properties.insert(name.clone(), json_schema_of(ty));
        }
        json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": self.fields.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>(),
        })
    }
}

fn json_schema_of(ty: &TypeRef) -> Value {
    match ty {
        TypeRef::Any => json!({}),
        TypeRef::Basic(BasicType::Str) => json!({"type": "string"}),
        TypeRef::Basic(BasicType::Int) => json!({"type": "integer"}),
        TypeRef::Basic(BasicType::Float) => json!({"type": "number"}),
        TypeRef::Basic(BasicType::Bool) => json!({"type": "boolean"}),
        TypeRef::List { item } => json!({"type": "array", "items": json_schema_of(item)}),
        TypeRef::Map { value, .. } => {
            json!({"type": "object", "additionalProperties": json_schema_of(value)})
        }
        TypeRef::Object { fields } => {
            let mut properties = serde_json::Map::new();
            for (name, field_ty) in fields {
                properties.insert(name.clone(), json_schema_of(field_ty));
            }
            json!({
                "type": "object",
                "properties": Value::Object(properties),
                "required": fields.keys().cloned().collect::<Vec<_>>(),
            })
        }
    }
}
