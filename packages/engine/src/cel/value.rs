use cel::Value as CelValue;
use serde_json::Value as JsonValue;

use crate::LixError;

pub fn json_to_cel(value: &JsonValue) -> Result<CelValue, LixError> {
    cel::to_value(value).map_err(|err| {
        LixError::validation(format!("failed to convert JSON value to CEL value: {err}"))
    })
}

pub fn cel_to_json(value: &CelValue) -> Result<JsonValue, LixError> {
    value.json().map_err(|err| {
        LixError::validation(format!("failed to convert CEL value to JSON value: {err}"))
    })
}
