//! Type descriptors: surface syntax → canonical type nodes → value validation.
//!
//! The surface grammar is `str | int | float | bool | list | dict | list[T] |
//! dict[K,V] | object`; whitespace inside generics is insignificant. `object`
//! parses to an empty [`TypeRef::Object`] — the surrounding declaration must
//! supply a `schema` to populate its fields, and rejecting a schema-less
//! `object` is the caller's job, not this module's.
//!
//! Runtime values travel as `serde_json::Value` and are checked against the
//! TypeRef tree recursively; a mismatch reports the failing path (e.g.
//! `items[2].name`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scalar leaf types of the surface grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasicType {
    Str,
    Int,
    Float,
    Bool,
}

/// Canonical type node. `Any` never appears in surface syntax; it is the
/// element type of a bare `list` or `dict` and accepts every value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeRef {
    Any,
    Basic(BasicType),
    List { item: Box<TypeRef> },
    Map { key: Box<TypeRef>, value: Box<TypeRef> },
    Object { fields: BTreeMap<String, TypeRef> },
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Any => write!(f, "any"),
            TypeRef::Basic(BasicType::Str) => write!(f, "str"),
            TypeRef::Basic(BasicType::Int) => write!(f, "int"),
            TypeRef::Basic(BasicType::Float) => write!(f, "float"),
            TypeRef::Basic(BasicType::Bool) => write!(f, "bool"),
            TypeRef::List { item } => match item.as_ref() {
                TypeRef::Any => write!(f, "list"),
                other => write!(f, "list[{}]", other),
            },
            TypeRef::Map { key, value } => match (key.as_ref(), value.as_ref()) {
                (TypeRef::Basic(BasicType::Str), TypeRef::Any) => write!(f, "dict"),
                (k, v) => write!(f, "dict[{},{}]", k, v),
            },
            TypeRef::Object { fields } => {
                write!(f, "object{{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", name, ty)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Type-descriptor parse error: byte position into the descriptor, what was
/// expected there, and what was found.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("type descriptor invalid at byte {pos}: expected {expected}, found `{found}`")]
pub struct TypeParseError {
    pub pos: usize,
    pub expected: &'static str,
    pub found: String,
}

/// Parses a surface type descriptor into a [`TypeRef`].
pub fn parse_type(descriptor: &str) -> Result<TypeRef, TypeParseError> {
    let mut p = Parser {
        src: descriptor,
        pos: 0,
    };
    p.skip_ws();
    let ty = p.parse()?;
    p.skip_ws();
    if p.pos != p.src.len() {
        return Err(TypeParseError {
            pos: p.pos,
            expected: "end of descriptor",
            found: p.rest_snippet(),
        });
    }
    Ok(ty)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while self.src[self.pos..].starts_with(|c: char| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn rest_snippet(&self) -> String {
        self.src[self.pos..].chars().take(12).collect()
    }

    fn take_word(&mut self) -> &'a str {
        let start = self.pos;
        while self.src[self.pos..].starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        &self.src[start..self.pos]
    }

    fn expect(&mut self, ch: char) -> Result<(), TypeParseError> {
        self.skip_ws();
        if self.src[self.pos..].starts_with(ch) {
            self.pos += ch.len_utf8();
            Ok(())
        } else {
            Err(TypeParseError {
                pos: self.pos,
                expected: match ch {
                    '[' => "`[`",
                    ']' => "`]`",
                    ',' => "`,`",
                    _ => "punctuation",
                },
                found: self.rest_snippet(),
            })
        }
    }

    fn peek_is(&mut self, ch: char) -> bool {
        self.skip_ws();
        self.src[self.pos..].starts_with(ch)
    }

    fn parse(&mut self) -> Result<TypeRef, TypeParseError> {
        self.skip_ws();
        let word_pos = self.pos;
        let word = self.take_word();
        match word {
            "str" => Ok(TypeRef::Basic(BasicType::Str)),
            "int" => Ok(TypeRef::Basic(BasicType::Int)),
            "float" => Ok(TypeRef::Basic(BasicType::Float)),
            "bool" => Ok(TypeRef::Basic(BasicType::Bool)),
            "object" => Ok(TypeRef::Object {
                fields: BTreeMap::new(),
            }),
            "list" => {
                if self.peek_is('[') {
                    self.expect('[')?;
                    let item = self.parse()?;
                    self.expect(']')?;
                    Ok(TypeRef::List {
                        item: Box::new(item),
                    })
                } else {
                    Ok(TypeRef::List {
                        item: Box::new(TypeRef::Any),
                    })
                }
            }
            "dict" => {
                if self.peek_is('[') {
                    self.expect('[')?;
                    let key = self.parse()?;
                    self.expect(',')?;
                    let value = self.parse()?;
                    self.expect(']')?;
                    Ok(TypeRef::Map {
                        key: Box::new(key),
                        value: Box::new(value),
                    })
                } else {
                    Ok(TypeRef::Map {
                        key: Box::new(TypeRef::Basic(BasicType::Str)),
                        value: Box::new(TypeRef::Any),
                    })
                }
            }
            _ => Err(TypeParseError {
                pos: word_pos,
                expected: "one of str, int, float, bool, list, dict, object",
                found: if word.is_empty() {
                    self.rest_snippet()
                } else {
                    word.to_string()
                },
            }),
        }
    }
}

/// Value/type mismatch: path to the offending value plus expected/got forms.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("`{path}`: expected {expected}, got {got}")]
pub struct TypeMismatch {
    pub path: String,
    pub expected: String,
    pub got: String,
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Validates `value` against `ty`, reporting the first failing path.
/// The root path is the empty string; nested failures read like `[2].name`.
pub fn validate_value(value: &Value, ty: &TypeRef) -> Result<(), TypeMismatch> {
    validate_at(value, ty, String::new())
}

fn mismatch(path: String, ty: &TypeRef, value: &Value) -> TypeMismatch {
    TypeMismatch {
        path,
        expected: ty.to_string(),
        got: value_kind(value).to_string(),
    }
}

fn validate_at(value: &Value, ty: &TypeRef, path: String) -> Result<(), TypeMismatch> {
    match ty {
        TypeRef::Any => Ok(()),
        TypeRef::Basic(BasicType::Str) => match value {
            Value::String(_) => Ok(()),
            _ => Err(mismatch(path, ty, value)),
        },
        TypeRef::Basic(BasicType::Int) => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(()),
            _ => Err(mismatch(path, ty, value)),
        },
        // Ints are acceptable floats; the reverse is not.
        TypeRef::Basic(BasicType::Float) => match value {
            Value::Number(_) => Ok(()),
            _ => Err(mismatch(path, ty, value)),
        },
        TypeRef::Basic(BasicType::Bool) => match value {
            Value::Bool(_) => Ok(()),
            _ => Err(mismatch(path, ty, value)),
        },
        TypeRef::List { item } => match value {
            Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    validate_at(v, item, format!("{}[{}]", path, i))?;
                }
                Ok(())
            }
            _ => Err(mismatch(path, ty, value)),
        },
        TypeRef::Map { key, value: val_ty } => match value {
            Value::Object(map) => {
                // JSON object keys are always strings; non-str key types only
                // need the declared key type to admit strings.
                if !matches!(key.as_ref(), TypeRef::Any | TypeRef::Basic(BasicType::Str)) {
                    return Err(TypeMismatch {
                        path,
                        expected: format!("dict with {} keys", key),
                        got: "str keys".to_string(),
                    });
                }
                for (k, v) in map {
                    validate_at(v, val_ty, format!("{}.{}", path, k))?;
                }
                Ok(())
            }
            _ => Err(mismatch(path, ty, value)),
        },
        TypeRef::Object { fields } => match value {
            Value::Object(map) => {
                for (name, field_ty) in fields {
                    match map.get(name) {
                        Some(v) => validate_at(v, field_ty, format!("{}.{}", path, name))?,
                        None => {
                            return Err(TypeMismatch {
                                path: format!("{}.{}", path, name),
                                expected: field_ty.to_string(),
                                got: "missing".to_string(),
                            })
                        }
                    }
                }
                Ok(())
            }
            _ => Err(mismatch(path, ty, value)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_basics() {
        assert_eq!(parse_type("str").unwrap(), TypeRef::Basic(BasicType::Str));
        assert_eq!(parse_type("int").unwrap(), TypeRef::Basic(BasicType::Int));
        assert_eq!(parse_type("float").unwrap(), TypeRef::Basic(BasicType::Float));
        assert_eq!(parse_type("bool").unwrap(), TypeRef::Basic(BasicType::Bool));
    }

    #[test]
    fn parses_generics_with_insignificant_whitespace() {
        assert_eq!(
            parse_type("list[ int ]").unwrap(),
            TypeRef::List {
                item: Box::new(TypeRef::Basic(BasicType::Int))
            }
        );
        assert_eq!(
            parse_type("dict[ str , list[float] ]").unwrap(),
            TypeRef::Map {
                key: Box::new(TypeRef::Basic(BasicType::Str)),
                value: Box::new(TypeRef::List {
                    item: Box::new(TypeRef::Basic(BasicType::Float))
                }),
            }
        );
    }

    #[test]
    fn bare_list_and_dict_take_any_elements() {
        assert_eq!(parse_type("list").unwrap().to_string(), "list");
        assert_eq!(parse_type("dict").unwrap().to_string(), "dict");
        assert!(validate_value(&json!([1, "two", true]), &parse_type("list").unwrap()).is_ok());
    }

    #[test]
    fn object_parses_to_empty_fields() {
        assert_eq!(
            parse_type("object").unwrap(),
            TypeRef::Object {
                fields: BTreeMap::new()
            }
        );
    }

    #[test]
    fn parse_error_carries_position_and_expected_form() {
        let err = parse_type("list[intt]").unwrap_err();
        assert_eq!(err.pos, 5);
        assert!(err.expected.contains("str"), "{}", err.expected);
        assert_eq!(err.found, "intt");

        let err = parse_type("dict[str]").unwrap_err();
        assert_eq!(err.expected, "`,`");
    }

    #[test]
    fn trailing_garbage_rejected() {
        let err = parse_type("int x").unwrap_err();
        assert_eq!(err.expected, "end of descriptor");
    }

    #[test]
    fn validates_scalars() {
        let int = parse_type("int").unwrap();
        assert!(validate_value(&json!(85), &int).is_ok());
        let err = validate_value(&json!("85"), &int).unwrap_err();
        assert_eq!(err.expected, "int");
        assert_eq!(err.got, "str");

        // Ints pass as floats; floats do not pass as ints.
        let float = parse_type("float").unwrap();
        assert!(validate_value(&json!(1), &float).is_ok());
        assert!(validate_value(&json!(1.5), &float).is_ok());
        assert!(validate_value(&json!(1.5), &int).is_err());
    }

    #[test]
    fn validates_nested_with_failing_path() {
        let ty = parse_type("list[dict[str,int]]").unwrap();
        let err = validate_value(&json!([{"a": 1}, {"b": "x"}]), &ty).unwrap_err();
        assert_eq!(err.path, "[1].b");
        assert_eq!(err.expected, "int");
    }

    #[test]
    fn validates_object_fields_recursively() {
        let ty = TypeRef::Object {
            fields: [
                ("name".to_string(), TypeRef::Basic(BasicType::Str)),
                (
                    "tags".to_string(),
                    TypeRef::List {
                        item: Box::new(TypeRef::Basic(BasicType::Str)),
                    },
                ),
            ]
            .into_iter()
            .collect(),
        };
        assert!(validate_value(&json!({"name": "n", "tags": ["a"]}), &ty).is_ok());

        let err = validate_value(&json!({"name": "n"}), &ty).unwrap_err();
        assert_eq!(err.path, ".tags");
        assert_eq!(err.got, "missing");
    }
}
