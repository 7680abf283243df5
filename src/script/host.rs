//! Lua script host.
//!
//! A [`ScriptHost`] owns one Lua state. Code is installed with
//! [`ScriptHost::load`], named functions are invoked through the
//! `begin_call`/`end_call` protocol, natives are exposed with
//! [`ScriptHost::register_function`], and script globals are persisted with
//! `save_game`/`load_game`.

use std::collections::HashSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{
    ChunkMode, FromLuaMulti, Function, HookTriggers, IntoLua, IntoLuaMulti, Lua, MultiValue,
    Table, Value, VmState,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::arguments::ArgumentChannel;
use super::call::{CallContext, CallState};
use super::persist;
use super::registry::{create_binding, native, NativeFunction, NativeFunctionRegistry};
use crate::config::ScriptConfig;
use crate::document::Node;
use crate::{Result, ScriptError};

/// Instructions between two limit checks.
const HOOK_INTERVAL: u32 = 10_000;

const TRACEBACK_MARKER: &str = "\nstack traceback:";

fn default_max_instructions() -> u64 {
    1_000_000
}

fn default_max_memory() -> usize {
    10 * 1024 * 1024 // 10MB
}

/// Resource limits applied to script execution.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceLimits {
    /// Maximum instructions per entry point (0 = unlimited).
    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,
    /// Maximum Lua heap size in bytes (0 = unlimited).
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_instructions: default_max_instructions(),
            max_memory: default_max_memory(),
        }
    }
}

impl ResourceLimits {
    /// No instruction or memory limit.
    pub fn unlimited() -> Self {
        Self {
            max_instructions: 0,
            max_memory: 0,
        }
    }
}

/// Lua scripting host with sandboxing and save/restore support.
pub struct ScriptHost {
    config: ScriptConfig,
    env: Table,
    wrapper: Option<Function>,
    baseline: HashSet<String>,
    registry: NativeFunctionRegistry,
    call: Option<CallContext>,
    last_error: Option<String>,
    instruction_count: Arc<AtomicU64>,
    lua: Lua,
}

impl ScriptHost {
    /// Create a host with the given configuration.
    pub fn new(config: ScriptConfig) -> Result<Self> {
        config.sandbox.validate()?;

        let lua = Lua::new();

        if config.limits.max_memory > 0 {
            lua.set_memory_limit(config.limits.max_memory)
                .map_err(|e| ScriptError::Config(format!("failed to set memory limit: {}", e)))?;
        }

        let env = config
            .sandbox
            .build_environment(&lua)
            .map_err(|e| ScriptError::Load(format!("failed to build script environment: {}", e)))?;

        let mut baseline = HashSet::new();
        for pair in env.pairs::<Value, Value>() {
            if let Ok((Value::String(key), _)) = pair {
                if let Ok(key) = key.to_str() {
                    baseline.insert(key.to_string());
                }
            }
        }

        debug!(
            sandboxed = config.sandbox.is_enabled(),
            baseline = baseline.len(),
            "Script host created"
        );

        Ok(Self {
            config,
            env,
            wrapper: None,
            baseline,
            registry: NativeFunctionRegistry::new(),
            call: None,
            last_error: None,
            instruction_count: Arc::new(AtomicU64::new(0)),
            lua,
        })
    }

    /// Host for untrusted content with default limits.
    pub fn sandboxed() -> Result<Self> {
        Self::new(ScriptConfig::default())
    }

    /// Host for trusted content: no sandbox wrapper, full standard library.
    pub fn trusted() -> Result<Self> {
        Self::new(ScriptConfig::trusted())
    }

    pub fn config(&self) -> &ScriptConfig {
        &self.config
    }

    pub fn is_sandboxed(&self) -> bool {
        self.config.sandbox.is_enabled()
    }

    pub fn call_state(&self) -> CallState {
        if self.call.is_some() {
            CallState::Armed
        } else {
            CallState::Idle
        }
    }

    /// Instructions executed by the most recent entry point (in steps of
    /// the hook interval; 0 when the instruction limit is disabled).
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &NativeFunctionRegistry {
        &self.registry
    }

    /// Message of the last failed `run_code`.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Underlying Lua state.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Table scripts resolve their globals in.
    pub fn environment(&self) -> &Table {
        &self.env
    }

    fn ensure_idle(&self, operation: &str) -> Result<()> {
        match &self.call {
            Some(active) => Err(ScriptError::Protocol(format!(
                "{} while a call to '{}' is armed",
                operation,
                active.function_name()
            ))),
            None => Ok(()),
        }
    }

    /// Run `f` under the instruction limit hook.
    fn guarded<T>(&self, f: impl FnOnce() -> mlua::Result<T>) -> mlua::Result<T> {
        self.instruction_count.store(0, Ordering::SeqCst);

        if self.config.limits.max_instructions > 0 {
            let count = Arc::clone(&self.instruction_count);
            let limit = self.config.limits.max_instructions;
            let step = u64::from(HOOK_INTERVAL);

            self.lua.set_hook(
                HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
                move |_lua, _debug| {
                    let current = count.fetch_add(step, Ordering::SeqCst) + step;
                    if current > limit {
                        Err(mlua::Error::RuntimeError(
                            "script exceeded instruction limit".to_string(),
                        ))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        let result = f();
        let _ = self.lua.remove_hook();
        result
    }

    fn sandbox_wrapper(&mut self) -> Result<Function> {
        if let Some(wrapper) = &self.wrapper {
            return Ok(wrapper.clone());
        }
        let wrapper = self.config.sandbox.install_wrapper(&self.lua)?;
        debug!(
            wrapper = %self.config.sandbox.wrapper_function_name,
            "Sandbox wrapper installed"
        );
        self.wrapper = Some(wrapper.clone());
        Ok(wrapper)
    }

    /// Install a chunk of code and run its top-level statements.
    ///
    /// With the sandbox enabled the chunk is compiled by the wrapper function
    /// against the restricted environment; binary chunks are rejected.
    pub fn load(&mut self, code: &str, name: &str) -> Result<()> {
        self.ensure_idle("load")?;
        debug!(chunk = name, sandboxed = self.is_sandboxed(), "Loading script code");

        let result = if self.is_sandboxed() {
            let wrapper = self.sandbox_wrapper()?;
            let env = self.env.clone();
            match self.guarded(|| wrapper.call::<(bool, Value)>((code, name, env))) {
                Ok((true, _)) => Ok(()),
                Ok((false, message)) => Err(ScriptError::Load(format!(
                    "{}: {}",
                    name,
                    describe(&message)
                ))),
                Err(e) => Err(ScriptError::Load(format!("{}: {}", name, e))),
            }
        } else {
            self.guarded(|| self.lua.load(code).set_name(name).exec())
                .map_err(|e| ScriptError::Load(format!("{}: {}", name, e)))
        };

        if let Err(e) = &result {
            warn!(chunk = name, error = %e, "Failed to load script code");
            self.debug_dump();
        }
        result
    }

    /// Arm a call to a named script function.
    ///
    /// The name is resolved now with a raw lookup, so no script metamethod
    /// runs outside the instruction limit. If it does not exist the failure
    /// is reported by [`ScriptHost::end_call`].
    pub fn begin_call(&mut self, function_name: &str) -> Result<()> {
        if let Some(active) = &self.call {
            return Err(ScriptError::Protocol(format!(
                "begin_call('{}') while a call to '{}' is armed",
                function_name,
                active.function_name()
            )));
        }

        let function = match self.env.raw_get::<Value>(function_name) {
            Ok(Value::Function(f)) => Some(f),
            _ => {
                debug!(function = function_name, "Script function not found");
                None
            }
        };
        self.call = Some(CallContext::new(function_name, function));
        Ok(())
    }

    /// Append an argument to the armed call.
    pub fn push_arg<V: IntoLua>(&mut self, value: V) -> Result<()> {
        let value = value
            .into_lua(&self.lua)
            .map_err(|e| ScriptError::Type(format!("can not convert argument: {}", e)))?;
        match self.call.as_mut() {
            Some(context) => {
                context.push_argument(value);
                Ok(())
            }
            None => Err(ScriptError::Protocol(
                "push_arg without begin_call".to_string(),
            )),
        }
    }

    /// Invoke the armed call and return to idle.
    pub fn end_call(&mut self) -> Result<MultiValue> {
        let context = self
            .call
            .take()
            .ok_or_else(|| ScriptError::Protocol("end_call without begin_call".to_string()))?;
        let name = context.function_name().to_string();

        let (function, arguments) = context.into_invocation().map_err(|e| {
            warn!(function = %name, "Call to undefined script function");
            e
        })?;

        debug!(function = %name, arguments = arguments.len(), "Calling script function");
        self.guarded(|| function.call::<MultiValue>(MultiValue::from_vec(arguments)))
            .map_err(|e| {
                let err = runtime_error(&e);
                warn!(function = %name, error = %err, "Script function failed");
                self.debug_dump();
                err
            })
    }

    /// Call a named function with arguments and convert its results.
    pub fn call_function<A, R>(&mut self, function_name: &str, args: A) -> Result<R>
    where
        A: IntoLuaMulti,
        R: FromLuaMulti,
    {
        let args = args
            .into_lua_multi(&self.lua)
            .map_err(|e| ScriptError::Type(format!("can not convert arguments: {}", e)))?;
        self.begin_call(function_name)?;
        for arg in args {
            self.push_arg(arg)?;
        }
        let values = self.end_call()?;
        self.unpack(values)
    }

    /// Execute ad-hoc code in the script environment.
    ///
    /// On failure the message is also kept in [`ScriptHost::last_error`].
    pub fn run_code(&mut self, code: &str) -> Result<MultiValue> {
        self.ensure_idle("run_code")?;

        let env = self.env.clone();
        let result = self.guarded(|| {
            let chunk = self.lua.load(code).set_name("=run_code").set_environment(env);
            let chunk = if self.is_sandboxed() {
                chunk.set_mode(ChunkMode::Text)
            } else {
                chunk
            };
            chunk.call::<MultiValue>(())
        });

        match result {
            Ok(values) => {
                self.last_error = None;
                Ok(values)
            }
            Err(e) => {
                let err = runtime_error(&e);
                warn!(error = %err, "Ad-hoc script code failed");
                self.last_error = Some(err.to_string());
                self.debug_dump();
                Err(err)
            }
        }
    }

    /// Run ad-hoc code and convert its results.
    pub fn eval<R: FromLuaMulti>(&mut self, code: &str) -> Result<R> {
        let values = self.run_code(code)?;
        self.unpack(values)
    }

    fn unpack<R: FromLuaMulti>(&self, values: MultiValue) -> Result<R> {
        R::from_lua_multi(values, &self.lua)
            .map_err(|e| ScriptError::Type(format!("can not convert results: {}", e)))
    }

    /// Expose a native callback as a global. Re-registering a name replaces
    /// the previous binding.
    pub fn register_function<F>(&mut self, name: &str, function: F) -> Result<()>
    where
        F: Fn(&mut ArgumentChannel) -> Result<usize> + 'static,
    {
        self.register_native(name, native(function))
    }

    /// Like [`ScriptHost::register_function`] for an already wrapped native.
    pub fn register_native(&mut self, name: &str, function: NativeFunction) -> Result<()> {
        create_binding(&self.lua, name, Rc::clone(&function))
            .and_then(|binding| self.env.raw_set(name, binding))
            .map_err(|e| ScriptError::runtime(format!("failed to register '{}': {}", name, e)))?;

        if self.registry.insert(name, function).is_some() {
            debug!(function = name, "Replaced native function binding");
        } else {
            debug!(function = name, "Registered native function");
        }
        Ok(())
    }

    fn persistence_skip_list(&self) -> HashSet<String> {
        let mut skip = self.baseline.clone();
        skip.extend(self.registry.names().into_iter().map(str::to_string));
        skip.insert(self.config.sandbox.wrapper_function_name.clone());
        skip
    }

    /// Write script globals under `root`, replacing any earlier saved state.
    pub fn save_game(&self, root: &mut Node) -> Result<()> {
        let state = persist::save_globals(&self.env, &self.persistence_skip_list())?;
        debug!(globals = state.children.len(), "Saved script state");
        root.remove_children(persist::STATE_NODE);
        root.children.push(state);
        Ok(())
    }

    /// Restore script globals saved by [`ScriptHost::save_game`].
    ///
    /// Globals missing from `root` keep their script-defined values.
    pub fn load_game(&mut self, root: &Node) -> Result<()> {
        self.ensure_idle("load_game")?;
        let restored = persist::load_globals(&self.lua, &self.env, root)?;
        debug!(globals = restored, "Restored script state");
        Ok(())
    }

    /// `name: type` for every global in the script environment, sorted.
    pub fn dump_globals(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .env
            .pairs::<Value, Value>()
            .filter_map(|pair| pair.ok())
            .filter_map(|(key, value)| match key {
                Value::String(s) => s
                    .to_str()
                    .ok()
                    .map(|s| format!("{}: {}", &*s, value.type_name())),
                _ => None,
            })
            .collect();
        lines.sort();
        lines
    }

    fn debug_dump(&self) {
        if !self.config.sandbox.debug_mode {
            return;
        }
        let lines = self.dump_globals();
        info!(count = lines.len(), "Script globals");
        for line in lines {
            info!("  {}", line);
        }
    }
}

/// Text for an error value returned through `pcall`.
fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Error(e) => e.to_string(),
        Value::Nil => "unknown error".to_string(),
        other => format!("[{}]", other.type_name()),
    }
}

/// Convert a Lua error into a runtime error with message and stack text.
fn runtime_error(err: &mlua::Error) -> ScriptError {
    if let Some(err) = native_error(err) {
        return err;
    }
    match err {
        mlua::Error::CallbackError { traceback, cause } => ScriptError::Runtime {
            message: cause.to_string(),
            stack: traceback.clone(),
        },
        mlua::Error::RuntimeError(text) => match text.find(TRACEBACK_MARKER) {
            Some(at) => ScriptError::Runtime {
                message: text[..at].to_string(),
                stack: text[at + 1..].to_string(),
            },
            None => ScriptError::runtime(text.clone()),
        },
        other => ScriptError::runtime(other.to_string()),
    }
}

/// Runtime error raised by a native callback, if `err` carries one.
fn native_error(err: &mlua::Error) -> Option<ScriptError> {
    match err {
        mlua::Error::ExternalError(inner) => match inner.downcast_ref::<ScriptError>() {
            Some(ScriptError::Runtime { message, stack }) => Some(ScriptError::Runtime {
                message: message.clone(),
                stack: stack.clone(),
            }),
            _ => None,
        },
        mlua::Error::CallbackError { cause, .. } => native_error(cause),
        _ => None,
    }
}
