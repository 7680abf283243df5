//! scripthost - sandboxed Lua scripting host.
//!
//! Loads behavior scripts into an embedded Lua runtime, runs them behind a
//! sandbox, marshals values between native callbacks and scripts, and saves
//! script globals into a state document.

pub mod config;
pub mod document;
pub mod error;
pub mod faction;
pub mod logging;
pub mod script;

pub use config::{Config, ScriptConfig};
pub use document::Node;
pub use error::{Result, ScriptError};
pub use faction::{FactionScript, FactionScripts};
pub use script::{
    native, ArgumentChannel, CallState, NativeFunction, NativeFunctionRegistry, ResourceLimits,
    SandboxPolicy, ScriptHost, Vec2f, Vec2i, Vec3f, Vec4f, Vec4i,
};
