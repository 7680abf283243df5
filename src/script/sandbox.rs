//! Sandbox policy and restricted environment construction.
//!
//! Sandboxed chunks are compiled by a small Lua wrapper function that runs in
//! the host's unrestricted global table and binds the chunk to a separate
//! environment table. That table only carries the capabilities listed in
//! [`SAFE_GLOBALS`] and [`SAFE_LIBRARIES`]; everything else (filesystem,
//! process control, dynamic loading, the debug library) is simply absent.

use mlua::{Function, Lua, Table, Value};
use serde::Deserialize;

use crate::{Result, ScriptError};

/// Default name of the sandbox wrapper function.
pub const DEFAULT_WRAPPER_FUNCTION_NAME: &str = "runsandboxed";

/// Default wrapper source. Called as `runsandboxed(code, chunk_name, env)`,
/// returns `true` on success or `false, message` on failure.
pub const DEFAULT_WRAPPER_CODE: &str = r#"
function runsandboxed(untrusted_code, chunk_name, env)
  if untrusted_code:byte(1) == 27 then
    return false, "binary bytecode prohibited"
  end
  local untrusted_function, message = load(untrusted_code, chunk_name, "t", env)
  if not untrusted_function then
    return false, message
  end
  return pcall(untrusted_function)
end
"#;

/// Base functions copied into the sandbox environment.
pub const SAFE_GLOBALS: &[&str] = &[
    "assert",
    "error",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "print",
    "select",
    "tonumber",
    "tostring",
    "type",
    "xpcall",
    "rawequal",
    "rawget",
    "rawset",
    "rawlen",
    "setmetatable",
    "getmetatable",
    "_VERSION",
];

/// Libraries shallow-copied into the sandbox environment.
pub const SAFE_LIBRARIES: &[&str] = &["string", "table", "math", "utf8", "coroutine"];

/// Library members withheld from sandboxed code.
const WITHHELD_MEMBERS: &[(&str, &str)] = &[("string", "dump")];

/// Hides the metatable shared by all strings. Its `__index` is the host's
/// own `string` table, which sandboxed code must not reach.
const LOCK_STRING_METATABLE: &str = r#"
local mt = getmetatable("")
if mt then
  mt.__metatable = false
end
"#;

fn default_wrapper_function_name() -> String {
    DEFAULT_WRAPPER_FUNCTION_NAME.to_string()
}

fn default_wrapper_code() -> String {
    DEFAULT_WRAPPER_CODE.to_string()
}

/// Sandbox and diagnostics settings for a script host.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxPolicy {
    /// Run loaded code directly in the full global table.
    #[serde(default)]
    pub disable_sandbox: bool,
    /// Log extra diagnostics (global table dumps) on failures.
    #[serde(default)]
    pub debug_mode: bool,
    /// Global name the wrapper code defines.
    #[serde(default = "default_wrapper_function_name")]
    pub wrapper_function_name: String,
    /// Lua source defining the wrapper function.
    #[serde(default = "default_wrapper_code")]
    pub wrapper_code: String,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            disable_sandbox: false,
            debug_mode: false,
            wrapper_function_name: default_wrapper_function_name(),
            wrapper_code: default_wrapper_code(),
        }
    }
}

impl SandboxPolicy {
    /// Policy for trusted content: no wrapper, full global table.
    pub fn trusted() -> Self {
        Self {
            disable_sandbox: true,
            ..Self::default()
        }
    }

    /// Whether loaded code is wrapped.
    pub fn is_enabled(&self) -> bool {
        !self.disable_sandbox
    }

    /// Check that the wrapper settings are usable.
    pub fn validate(&self) -> Result<()> {
        if !is_lua_identifier(&self.wrapper_function_name) {
            return Err(ScriptError::Config(format!(
                "sandbox wrapper function name '{}' is not a valid Lua identifier",
                self.wrapper_function_name
            )));
        }
        if !self.wrapper_code.contains(&self.wrapper_function_name) {
            return Err(ScriptError::Config(format!(
                "sandbox wrapper code does not define '{}'",
                self.wrapper_function_name
            )));
        }
        Ok(())
    }

    /// Build the environment table scripts run in.
    ///
    /// Returns the real global table when the sandbox is disabled.
    pub fn build_environment(&self, lua: &Lua) -> mlua::Result<Table> {
        let globals = lua.globals();
        if self.disable_sandbox {
            return Ok(globals);
        }

        let env = lua.create_table()?;
        for name in SAFE_GLOBALS {
            let value: Value = globals.get(*name)?;
            if !value.is_nil() {
                env.raw_set(*name, value)?;
            }
        }

        for lib in SAFE_LIBRARIES {
            let Value::Table(source) = globals.get::<Value>(*lib)? else {
                continue;
            };
            let copy = lua.create_table()?;
            for pair in source.pairs::<Value, Value>() {
                let (key, value) = pair?;
                copy.raw_set(key, value)?;
            }
            for (withheld_lib, member) in WITHHELD_MEMBERS {
                if withheld_lib == lib {
                    copy.raw_set(*member, Value::Nil)?;
                }
            }
            env.raw_set(*lib, copy)?;
        }

        env.raw_set("_G", env.clone())?;

        lua.load(LOCK_STRING_METATABLE)
            .set_name("=sandbox")
            .exec()?;
        Ok(env)
    }

    /// Compile and run the wrapper code, returning the wrapper function.
    pub fn install_wrapper(&self, lua: &Lua) -> Result<Function> {
        lua.load(self.wrapper_code.as_str())
            .set_name("=sandbox")
            .exec()
            .map_err(|e| ScriptError::Load(format!("failed to build sandbox wrapper: {}", e)))?;

        match lua.globals().get::<Value>(self.wrapper_function_name.as_str()) {
            Ok(Value::Function(f)) => Ok(f),
            _ => Err(ScriptError::Load(format!(
                "sandbox wrapper code did not define function '{}'",
                self.wrapper_function_name
            ))),
        }
    }
}

fn is_lua_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = SandboxPolicy::default();
        assert!(policy.is_enabled());
        assert!(!policy.debug_mode);
        assert_eq!(policy.wrapper_function_name, "runsandboxed");
        assert!(policy.validate().is_ok());
        assert!(!SandboxPolicy::trusted().is_enabled());
    }

    #[test]
    fn test_validate_bad_identifier() {
        let policy = SandboxPolicy {
            wrapper_function_name: "run sandboxed".to_string(),
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(ScriptError::Config(_))));
    }

    #[test]
    fn test_validate_name_missing_from_code() {
        let policy = SandboxPolicy {
            wrapper_function_name: "wrap".to_string(),
            wrapper_code: "function other() end".to_string(),
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_environment_excludes_dangerous_globals() {
        let lua = Lua::new();
        let env = SandboxPolicy::default().build_environment(&lua).unwrap();

        for name in ["os", "io", "load", "loadfile", "dofile", "require", "package", "debug"] {
            let value: Value = env.get(name).unwrap();
            assert!(value.is_nil(), "{} should be absent", name);
        }
        let string_lib: Table = env.get("string").unwrap();
        assert!(string_lib.get::<Value>("dump").unwrap().is_nil());
        assert!(string_lib.get::<Value>("upper").unwrap().is_function());
        assert!(env.get::<Value>("pairs").unwrap().is_function());
    }

    #[test]
    fn test_environment_library_copy_is_isolated() {
        let lua = Lua::new();
        let env = SandboxPolicy::default().build_environment(&lua).unwrap();
        lua.load("string.upper = nil")
            .set_environment(env)
            .exec()
            .unwrap();

        let host_string: Table = lua.globals().get("string").unwrap();
        assert!(host_string.get::<Value>("upper").unwrap().is_function());
    }

    #[test]
    fn test_string_metatable_hidden_from_sandbox() {
        let lua = Lua::new();
        let env = SandboxPolicy::default().build_environment(&lua).unwrap();

        let hidden: Value = lua
            .load("return getmetatable('')")
            .set_environment(env.clone())
            .eval()
            .unwrap();
        assert_eq!(hidden, Value::Boolean(false));

        let tamper = lua
            .load("getmetatable('').__index.upper = function() return 'changed' end")
            .set_environment(env.clone())
            .exec();
        assert!(tamper.is_err());

        let upper: String = lua
            .load("return ('abc'):upper()")
            .set_environment(env)
            .eval()
            .unwrap();
        assert_eq!(upper, "ABC");
    }

    #[test]
    fn test_disabled_sandbox_uses_globals() {
        let lua = Lua::new();
        let env = SandboxPolicy::trusted().build_environment(&lua).unwrap();
        assert!(env.get::<Value>("os").unwrap().is_table());
        let mt: Value = lua.load("return getmetatable('')").eval().unwrap();
        assert!(mt.is_table());
    }

    #[test]
    fn test_install_wrapper() {
        let lua = Lua::new();
        let wrapper = SandboxPolicy::default().install_wrapper(&lua).unwrap();
        let env = lua.create_table().unwrap();
        let (ok, _): (bool, Value) = wrapper.call(("x = 1", "=unit", env.clone())).unwrap();
        assert!(ok);
        assert_eq!(env.get::<i64>("x").unwrap(), 1);
    }

    #[test]
    fn test_install_wrapper_broken_code() {
        let lua = Lua::new();
        let policy = SandboxPolicy {
            wrapper_code: "function runsandboxed(".to_string(),
            ..Default::default()
        };
        assert!(matches!(policy.install_wrapper(&lua), Err(ScriptError::Load(_))));
    }
}
