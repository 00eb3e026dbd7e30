use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeList {
    pub nodes: Vec<Node>,
}

/// Node info as reported by the device. Only `name` is interpreted; status and
/// version blocks are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDetail {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Value of a device parameter.
///
/// On the wire this is a single-key object naming the active union member
/// (`{"integer_value": 42}`). The list endpoint sends bare values instead, so
/// plain JSON scalars are accepted too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ParamValue {
    Empty,
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Text(String),
    Opaque(Value),
}

impl ParamValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Empty,
            Value::Bool(flag) => Self::Boolean(flag),
            Value::Number(number) => scalar_number(&number)
                .unwrap_or_else(|| Self::Opaque(Value::Number(number))),
            Value::String(text) => Self::Text(text),
            Value::Object(map) if map.len() == 1 => {
                let parsed = map.iter().next().and_then(|(tag, inner)| tagged(tag, inner));
                parsed.unwrap_or(Self::Opaque(Value::Object(map)))
            }
            Value::Object(map) if map.is_empty() => Self::Empty,
            other => Self::Opaque(other),
        }
    }
}

fn scalar_number(number: &serde_json::Number) -> Option<ParamValue> {
    if let Some(value) = number.as_i64() {
        return Some(ParamValue::Integer(value));
    }
    number.as_f64().map(ParamValue::Real)
}

fn tagged(tag: &str, inner: &Value) -> Option<ParamValue> {
    match (tag, inner) {
        ("empty", _) => Some(ParamValue::Empty),
        ("integer_value", Value::Number(number)) => number.as_i64().map(ParamValue::Integer),
        ("real_value", Value::Number(number)) => number.as_f64().map(ParamValue::Real),
        ("boolean_value", Value::Bool(flag)) => Some(ParamValue::Boolean(*flag)),
        ("boolean_value", Value::Number(number)) => {
            number.as_i64().map(|value| ParamValue::Boolean(value != 0))
        }
        ("string_value", Value::String(text)) => Some(ParamValue::Text(text.clone())),
        _ => None,
    }
}

impl From<ParamValue> for Value {
    fn from(value: ParamValue) -> Self {
        let (tag, inner) = match value {
            ParamValue::Empty => ("empty", Value::Object(Map::new())),
            ParamValue::Integer(value) => ("integer_value", Value::from(value)),
            ParamValue::Real(value) => ("real_value", Value::from(value)),
            ParamValue::Boolean(flag) => ("boolean_value", Value::from(flag)),
            ParamValue::Text(text) => ("string_value", Value::from(text)),
            ParamValue::Opaque(raw) => return raw,
        };
        let mut map = Map::new();
        map.insert(tag.to_string(), inner);
        Value::Object(map)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Boolean(flag) => write!(f, "{flag}"),
            Self::Text(text) => f.write_str(text),
            Self::Opaque(raw) => write!(f, "{raw}"),
        }
    }
}

/// One parameter as returned by the get/set endpoints. The list endpoint only
/// fills `name` and `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<ParamValue>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
            default_value: None,
            min_value: None,
            max_value: None,
        }
    }
}

/// Body of a parameter write. The device bridge expects the bare value, not the
/// tagged union.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamWrite {
    pub value: Value,
}

impl ParamWrite {
    pub fn new(value: &ParamValue) -> Self {
        let value = match value {
            ParamValue::Empty => Value::Null,
            ParamValue::Integer(value) => Value::from(*value),
            ParamValue::Real(value) => Value::from(*value),
            ParamValue::Boolean(flag) => Value::from(*flag),
            ParamValue::Text(text) => Value::from(text.as_str()),
            ParamValue::Opaque(raw) => raw.clone(),
        };
        Self { value }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_tagged_and_bare_values() {
        let tagged: ParamValue = serde_json::from_value(json!({"integer_value": 42})).unwrap();
        let bare: ParamValue = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(tagged, ParamValue::Integer(42));
        assert_eq!(bare, ParamValue::Integer(42));

        let text: ParamValue = serde_json::from_value(json!({"string_value": "eco"})).unwrap();
        assert_eq!(text, ParamValue::Text("eco".to_string()));

        let empty: ParamValue = serde_json::from_value(json!({"empty": {}})).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn keeps_unknown_tags_opaque() {
        let raw = json!({"vendor_value": [1, 2]});
        let value: ParamValue = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(value, ParamValue::Opaque(raw.clone()));
        assert_eq!(serde_json::to_value(&value).unwrap(), raw);
    }

    #[test]
    fn serializes_as_tagged_union() {
        let value = serde_json::to_value(ParamValue::Integer(7)).unwrap();
        assert_eq!(value, json!({"integer_value": 7}));
    }

    #[test]
    fn parses_getset_response_with_bounds() {
        let body = json!({
            "name": "CONFIG_DIMMER_DUTY_CYCLE",
            "value": {"integer_value": 55},
            "default_value": {"integer_value": 0},
            "min_value": {"integer_value": 0},
            "max_value": {"integer_value": 100},
        });
        let param: Parameter = serde_json::from_value(body).unwrap();
        assert_eq!(param.value.as_integer(), Some(55));
        assert_eq!(param.max_value, Some(ParamValue::Integer(100)));
    }

    #[test]
    fn node_detail_keeps_extra_fields() {
        let body = json!({
            "name": "org.kanthaus.dimmer",
            "software_version": {"major": 1, "minor": 2},
        });
        let detail: NodeDetail = serde_json::from_value(body).unwrap();
        assert_eq!(detail.name, "org.kanthaus.dimmer");
        assert!(detail.extra.contains_key("software_version"));
    }

    #[test]
    fn write_body_is_untagged() {
        let body = serde_json::to_value(ParamWrite::new(&ParamValue::Integer(9))).unwrap();
        assert_eq!(body, json!({"value": 9}));
    }
}
