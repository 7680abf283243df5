//! Embedded Lua scripting host.
//!
//! Loads designer-authored behavior scripts, runs them inside a restricted
//! environment, exposes native callbacks to them and persists their globals
//! across save/restore.

pub mod arguments;
pub mod call;
pub mod host;
pub mod persist;
pub mod registry;
pub mod sandbox;
pub mod types;

pub use arguments::ArgumentChannel;
pub use call::{CallContext, CallState};
pub use host::{ResourceLimits, ScriptHost};
pub use registry::{native, NativeFunction, NativeFunctionRegistry};
pub use sandbox::SandboxPolicy;
pub use types::{Vec2f, Vec2i, Vec3f, Vec4f, Vec4i};
