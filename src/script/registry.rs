//! Native function registry.

use std::collections::HashMap;
use std::rc::Rc;

use mlua::{Function, Lua, MultiValue};

use super::arguments::ArgumentChannel;
use crate::{Result, ScriptError};

/// Native callback exposed to scripts.
///
/// Receives the argument channel of the current call and returns the number
/// of values the script caller gets back.
pub type NativeFunction = Rc<dyn Fn(&mut ArgumentChannel) -> Result<usize>>;

/// Wrap a closure as a [`NativeFunction`].
pub fn native<F>(function: F) -> NativeFunction
where
    F: Fn(&mut ArgumentChannel) -> Result<usize> + 'static,
{
    Rc::new(function)
}

/// Name to native callback mapping for one host.
#[derive(Default, Clone)]
pub struct NativeFunctionRegistry {
    functions: HashMap<String, NativeFunction>,
}

impl NativeFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a binding. Returns the previous binding, if any.
    pub fn insert(&mut self, name: &str, function: NativeFunction) -> Option<NativeFunction> {
        self.functions.insert(name.to_string(), function)
    }

    pub fn get(&self, name: &str) -> Option<&NativeFunction> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for NativeFunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// Create the Lua function that dispatches to `function`.
///
/// Every error the native returns is escalated to a runtime error carrying
/// the script call stack, and aborts the calling chunk.
pub(crate) fn create_binding(lua: &Lua, name: &str, function: NativeFunction) -> mlua::Result<Function> {
    let name = name.to_string();
    lua.create_function(move |lua, args: MultiValue| {
        let mut channel = ArgumentChannel::new(lua, &name, args);
        let declared = match function(&mut channel) {
            Ok(declared) => declared,
            Err(err) => return Err(mlua::Error::external(escalate(err, &channel))),
        };
        channel.into_returns(declared).map_err(mlua::Error::external)
    })
}

fn escalate(err: ScriptError, channel: &ArgumentChannel) -> ScriptError {
    match err {
        ScriptError::Runtime { message, stack } if stack.is_empty() => ScriptError::Runtime {
            message,
            stack: channel.stack_text(),
        },
        err @ ScriptError::Runtime { .. } => err,
        other => ScriptError::Runtime {
            message: other.to_string(),
            stack: channel.stack_text(),
        },
    }
}
