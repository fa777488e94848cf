use cel::Context;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::functions::{FunctionProvider, SharedFunctionProvider};
use crate::LixError;

use super::value::json_to_cel;

/// Builds the default-value evaluation context: every property of the row
/// being written is a variable, and `lix_uuid_v7()` / `lix_timestamp()` route
/// through the shared provider so deterministic mode applies.
pub fn build_context_with_functions<P>(
    variables: &JsonMap<String, JsonValue>,
    functions: SharedFunctionProvider<P>,
) -> Result<Context<'static>, LixError>
where
    P: FunctionProvider + Send + 'static,
{
    let mut context = Context::default();

    let uuid_provider = functions.clone();
    context.add_function("lix_uuid_v7", move || uuid_provider.uuid_v7());
    let timestamp_provider = functions;
    context.add_function("lix_timestamp", move || timestamp_provider.timestamp());

    for (name, value) in variables {
        let cel_value = json_to_cel(value)?;
        context.add_variable_from_value(name.clone(), cel_value);
    }

    Ok(context)
}
