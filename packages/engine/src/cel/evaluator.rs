use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cel::Program;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::functions::{FunctionProvider, SharedFunctionProvider};
use crate::LixError;

use super::context::build_context_with_functions;
use super::value::cel_to_json;

#[derive(Debug)]
struct CompiledProgram {
    program: Program,
}

/// Evaluates `x-lix-default` expressions. Programs are compiled once per
/// expression text and cached for the lifetime of the handle.
#[derive(Default)]
pub struct CelEvaluator {
    programs: RwLock<HashMap<String, Arc<CompiledProgram>>>,
}

impl CelEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate_with_functions<P>(
        &self,
        expression: &str,
        variables: &JsonMap<String, JsonValue>,
        functions: SharedFunctionProvider<P>,
    ) -> Result<JsonValue, LixError>
    where
        P: FunctionProvider + Send + 'static,
    {
        let compiled = self.compile(expression)?;
        let context = build_context_with_functions(variables, functions)?;
        let value = compiled.program.execute(&context).map_err(|err| {
            LixError::validation(format!(
                "failed to evaluate CEL expression '{expression}': {err}"
            ))
        })?;
        cel_to_json(&value)
    }

    fn compile(&self, expression: &str) -> Result<Arc<CompiledProgram>, LixError> {
        if let Some(existing) = self.programs.read().unwrap().get(expression).cloned() {
            return Ok(existing);
        }

        let program = Program::compile(expression).map_err(|err| {
            LixError::validation(format!(
                "failed to parse CEL expression '{expression}': {err}"
            ))
        })?;
        let compiled = Arc::new(CompiledProgram { program });

        self.programs
            .write()
            .unwrap()
            .insert(expression.to_string(), compiled.clone());

        Ok(compiled)
    }
}
