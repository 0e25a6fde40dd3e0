use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContractValue {
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<ContractValue>),
    Map(BTreeMap<String, ContractValue>),
}

impl ContractValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
        }
    }
}

/// The defined string conversion for values surfaced to the host.
/// Integral numbers render without a fractional part.
pub fn value_to_text(value: &ContractValue) -> String {
    match value {
        ContractValue::Bool(value) => value.to_string(),
        ContractValue::Number(value) => {
            if value.fract().abs() < f64::EPSILON {
                (*value as i64).to_string()
            } else {
                value.to_string()
            }
        }
        ContractValue::String(value) => value.clone(),
        ContractValue::Array(values) => format!(
            "[{}]",
            values.iter().map(value_to_text).collect::<Vec<_>>().join(", ")
        ),
        ContractValue::Map(values) => {
            let entries = values
                .iter()
                .map(|(key, value)| format!("{}: {}", key, value_to_text(value)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{{{}}}", entries)
        }
    }
}
