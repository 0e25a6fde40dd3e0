use std::collections::BTreeMap;

use cvm_core::{value_to_text, ContractValue, VmError};
use rhai::{Array, Dynamic, EvalAltResult, ImmutableString, Map, Position, FLOAT, INT};

pub(crate) fn script_error(code: &str, message: impl AsRef<str>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(format!("{}: {}", code, message.as_ref())),
        Position::NONE,
    ))
}

pub(crate) fn forward_vm_error(error: VmError) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(error.to_string()),
        Position::NONE,
    ))
}

pub(crate) fn contract_value_to_dynamic(value: &ContractValue) -> Dynamic {
    match value {
        ContractValue::Bool(value) => Dynamic::from_bool(*value),
        ContractValue::Number(value) => Dynamic::from_float(*value as FLOAT),
        ContractValue::String(value) => Dynamic::from(value.clone()),
        ContractValue::Array(values) => {
            let mut array = Array::new();
            for value in values {
                array.push(contract_value_to_dynamic(value));
            }
            Dynamic::from_array(array)
        }
        ContractValue::Map(values) => {
            let mut map = Map::new();
            for (key, value) in values {
                map.insert(key.clone().into(), contract_value_to_dynamic(value));
            }
            Dynamic::from_map(map)
        }
    }
}

pub(crate) fn dynamic_to_contract_value(value: Dynamic) -> Result<ContractValue, Box<EvalAltResult>> {
    if value.is::<bool>() {
        return Ok(ContractValue::Bool(value.cast::<bool>()));
    }
    if value.is::<INT>() {
        return Ok(ContractValue::Number(value.cast::<INT>() as f64));
    }
    if value.is::<FLOAT>() {
        return Ok(ContractValue::Number(value.cast::<FLOAT>()));
    }
    if value.is::<ImmutableString>() {
        return Ok(ContractValue::String(
            value.cast::<ImmutableString>().to_string(),
        ));
    }
    if value.is::<Array>() {
        let array = value.cast::<Array>();
        let mut out = Vec::with_capacity(array.len());
        for item in array {
            out.push(dynamic_to_contract_value(item)?);
        }
        return Ok(ContractValue::Array(out));
    }
    if value.is::<Map>() {
        let map = value.cast::<Map>();
        let mut out = BTreeMap::new();
        for (key, value) in map {
            out.insert(key.to_string(), dynamic_to_contract_value(value)?);
        }
        return Ok(ContractValue::Map(out));
    }

    Err(script_error(
        "VALUE_UNSUPPORTED",
        format!("Script value of type \"{}\" cannot cross the bridge.", value.type_name()),
    ))
}

/// Text rendering for a script's final value. Values outside the bridge
/// model (char, function pointers) fall back to Rhai's own rendering.
pub(crate) fn dynamic_to_output_text(value: &Dynamic) -> String {
    match dynamic_to_contract_value(value.clone()) {
        Ok(value) => value_to_text(&value),
        Err(_) => value.to_string(),
    }
}
