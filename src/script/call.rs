//! Call protocol state for named script functions.

use mlua::{Function, Value};

use crate::{Result, ScriptError};

/// Host call state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No call in flight; `load` and `run_code` are allowed.
    Idle,
    /// `begin_call` done, waiting for `end_call`.
    Armed,
}

/// Transient state of one in-flight call.
#[derive(Debug)]
pub struct CallContext {
    function_name: String,
    function: Option<Function>,
    arguments: Vec<Value>,
}

impl CallContext {
    /// Arm a call. `function` is `None` when the name did not resolve.
    pub fn new(function_name: &str, function: Option<Function>) -> Self {
        Self {
            function_name: function_name.to_string(),
            function,
            arguments: Vec::new(),
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Whether the name resolved to a function at `begin_call` time.
    pub fn is_valid(&self) -> bool {
        self.function.is_some()
    }

    pub fn argument_count(&self) -> usize {
        self.arguments.len()
    }

    pub fn push_argument(&mut self, value: Value) {
        self.arguments.push(value);
    }

    /// Split into the resolved function and its arguments.
    ///
    /// Fails with a lookup error when the name did not resolve.
    pub fn into_invocation(self) -> Result<(Function, Vec<Value>)> {
        match self.function {
            Some(function) => Ok((function, self.arguments)),
            None => Err(ScriptError::Lookup(self.function_name)),
        }
    }
}
