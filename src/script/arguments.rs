//! Argument channel for native callbacks.
//!
//! One channel exists per native invocation. It exposes the arguments Lua
//! passed (0-based index) and collects the values the native returns.

use mlua::{Lua, MultiValue, Value};

use super::types::{Vec2f, Vec2i, Vec3f, Vec4f, Vec4i};
use crate::{Result, ScriptError};

/// Value queued for return to the script caller.
#[derive(Debug, Clone, PartialEq)]
enum Pending {
    Nil,
    Int(i32),
    Float(f32),
    Bool(bool),
    Str(String),
    IntArray(Vec<i32>),
    FloatArray(Vec<f32>),
}

impl Pending {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        Ok(match self {
            Pending::Nil => Value::Nil,
            Pending::Int(v) => Value::Integer(v.into()),
            Pending::Float(v) => Value::Number(v.into()),
            Pending::Bool(v) => Value::Boolean(v),
            Pending::Str(v) => Value::String(lua.create_string(&v)?),
            Pending::IntArray(v) => Value::Table(lua.create_sequence_from(v)?),
            Pending::FloatArray(v) => {
                Value::Table(lua.create_sequence_from(v.into_iter().map(f64::from))?)
            }
        })
    }
}

/// Marshaling context bound to one in-flight native call.
pub struct ArgumentChannel<'a> {
    lua: &'a Lua,
    function_name: &'a str,
    arguments: Vec<Value>,
    returns: Vec<Pending>,
}

impl<'a> ArgumentChannel<'a> {
    /// Bind a channel to the arguments of the current call.
    pub fn new(lua: &'a Lua, function_name: &'a str, arguments: MultiValue) -> Self {
        Self {
            lua,
            function_name,
            arguments: arguments.into_iter().collect(),
            returns: Vec::new(),
        }
    }

    /// Name the native was registered under.
    pub fn function_name(&self) -> &str {
        self.function_name
    }

    /// Number of arguments the script passed.
    pub fn argument_count(&self) -> usize {
        self.arguments.len()
    }

    /// Number of values pushed with the `return_*` methods so far.
    pub fn return_count(&self) -> usize {
        self.returns.len()
    }

    fn argument(&self, index: usize) -> Result<&Value> {
        self.arguments.get(index).ok_or_else(|| {
            ScriptError::Type(format!(
                "{}: argument {} out of range ({} given)",
                self.function_name,
                index,
                self.arguments.len()
            ))
        })
    }

    fn mismatch(&self, index: usize, expected: &str, value: &Value) -> ScriptError {
        ScriptError::Type(format!(
            "{}: can not get {} from argument {} ({})",
            self.function_name,
            expected,
            index,
            value.type_name()
        ))
    }

    /// Raw argument value.
    pub fn get_value(&self, index: usize) -> Result<Value> {
        self.argument(index).cloned()
    }

    pub fn get_int(&self, index: usize) -> Result<i32> {
        let value = self.argument(index)?;
        to_int(value).ok_or_else(|| self.mismatch(index, "int", value))
    }

    pub fn get_float(&self, index: usize) -> Result<f32> {
        let value = self.argument(index)?;
        to_float(value).ok_or_else(|| self.mismatch(index, "float", value))
    }

    pub fn get_bool(&self, index: usize) -> Result<bool> {
        match self.argument(index)? {
            Value::Boolean(b) => Ok(*b),
            other => Err(self.mismatch(index, "bool", other)),
        }
    }

    /// String argument. Numbers are converted the way Lua's `tostring` does.
    pub fn get_string(&self, index: usize) -> Result<String> {
        let value = self.argument(index)?;
        match value {
            Value::String(s) => s
                .to_str()
                .map(|s| s.to_string())
                .map_err(|_| self.mismatch(index, "UTF-8 string", value)),
            Value::Integer(i) => Ok(i.to_string()),
            Value::Number(_) => match self.lua.coerce_string(value.clone()) {
                Ok(Some(s)) => Ok(s.to_string_lossy().to_string()),
                _ => Err(self.mismatch(index, "string", value)),
            },
            other => Err(self.mismatch(index, "string", other)),
        }
    }

    pub fn get_vec2i(&self, index: usize) -> Result<Vec2i> {
        self.int_components::<2>(index, "Vec2i").map(Vec2i::from)
    }

    pub fn get_vec4i(&self, index: usize) -> Result<Vec4i> {
        self.int_components::<4>(index, "Vec4i").map(Vec4i::from)
    }

    pub fn get_vec2f(&self, index: usize) -> Result<Vec2f> {
        self.float_components::<2>(index, "Vec2f").map(Vec2f::from)
    }

    pub fn get_vec3f(&self, index: usize) -> Result<Vec3f> {
        self.float_components::<3>(index, "Vec3f").map(Vec3f::from)
    }

    pub fn get_vec4f(&self, index: usize) -> Result<Vec4f> {
        self.float_components::<4>(index, "Vec4f").map(Vec4f::from)
    }

    /// Integer sequence `{a, b, ...}` of any length.
    pub fn get_vector_int(&self, index: usize) -> Result<Vec<i32>> {
        let value = self.argument(index)?;
        let Value::Table(table) = value else {
            return Err(self.mismatch(index, "int vector", value));
        };
        let len = table.raw_len();
        let mut out = Vec::with_capacity(len);
        for slot in 1..=len {
            let item: Value = table
                .raw_get(slot)
                .map_err(|_| self.mismatch(index, "int vector", value))?;
            out.push(to_int(&item).ok_or_else(|| self.mismatch(index, "int vector", value))?);
        }
        Ok(out)
    }

    fn components<T: Copy + Default, const N: usize>(
        &self,
        index: usize,
        expected: &str,
        convert: fn(&Value) -> Option<T>,
    ) -> Result<[T; N]> {
        let value = self.argument(index)?;
        let Value::Table(table) = value else {
            return Err(self.mismatch(index, expected, value));
        };
        let mut out = [T::default(); N];
        for (slot, component) in out.iter_mut().enumerate() {
            let item: Value = table
                .raw_get(slot + 1)
                .map_err(|_| self.mismatch(index, expected, value))?;
            *component = convert(&item).ok_or_else(|| self.mismatch(index, expected, value))?;
        }
        Ok(out)
    }

    fn int_components<const N: usize>(&self, index: usize, expected: &str) -> Result<[i32; N]> {
        self.components::<i32, N>(index, expected, to_int)
    }

    fn float_components<const N: usize>(&self, index: usize, expected: &str) -> Result<[f32; N]> {
        self.components::<f32, N>(index, expected, to_float)
    }

    pub fn return_nil(&mut self) {
        self.returns.push(Pending::Nil);
    }

    pub fn return_int(&mut self, value: i32) {
        self.returns.push(Pending::Int(value));
    }

    pub fn return_float(&mut self, value: f32) {
        self.returns.push(Pending::Float(value));
    }

    pub fn return_bool(&mut self, value: bool) {
        self.returns.push(Pending::Bool(value));
    }

    pub fn return_string(&mut self, value: &str) {
        self.returns.push(Pending::Str(value.to_string()));
    }

    pub fn return_vec2i(&mut self, value: Vec2i) {
        self.returns.push(Pending::IntArray(<[i32; 2]>::from(value).to_vec()));
    }

    pub fn return_vec4i(&mut self, value: Vec4i) {
        self.returns.push(Pending::IntArray(<[i32; 4]>::from(value).to_vec()));
    }

    pub fn return_vec2f(&mut self, value: Vec2f) {
        self.returns.push(Pending::FloatArray(<[f32; 2]>::from(value).to_vec()));
    }

    pub fn return_vec3f(&mut self, value: Vec3f) {
        self.returns.push(Pending::FloatArray(<[f32; 3]>::from(value).to_vec()));
    }

    pub fn return_vec4f(&mut self, value: Vec4f) {
        self.returns.push(Pending::FloatArray(<[f32; 4]>::from(value).to_vec()));
    }

    pub fn return_vector_int(&mut self, value: &[i32]) {
        self.returns.push(Pending::IntArray(value.to_vec()));
    }

    /// Build a runtime error carrying `message` and the current call stack.
    ///
    /// Return it from the native to abort the running call chain.
    pub fn raise(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Runtime {
            message: message.into(),
            stack: self.stack_text(),
        }
    }

    /// Formatted view of the script frames that led to this native call.
    pub fn stack_text(&self) -> String {
        let mut text = String::from("stack traceback:");
        let mut level = 1;
        while let Some(frame) = self.lua.inspect_stack(level) {
            let source = frame.source();
            let names = frame.names();
            text.push_str(&format!(
                "\n\t{}:{}: in function '{}'",
                source.short_src.as_deref().unwrap_or("?"),
                frame.curr_line(),
                names.name.as_deref().unwrap_or("?")
            ));
            level += 1;
        }
        text
    }

    /// Convert the last `declared` pushed values into the call result.
    pub(crate) fn into_returns(self, declared: usize) -> Result<MultiValue> {
        let pushed = self.returns.len();
        if declared > pushed {
            return Err(ScriptError::Runtime {
                message: format!(
                    "{}: declared {} return values but pushed {}",
                    self.function_name, declared, pushed
                ),
                stack: self.stack_text(),
            });
        }
        if declared < pushed {
            tracing::debug!(
                function = self.function_name,
                declared,
                pushed,
                "Dropping surplus native return values"
            );
        }

        let lua = self.lua;
        self.returns
            .into_iter()
            .skip(pushed - declared)
            .map(|pending| pending.into_lua(lua))
            .collect::<mlua::Result<Vec<Value>>>()
            .map(MultiValue::from_vec)
            .map_err(|e| ScriptError::runtime(format!("failed to marshal return values: {}", e)))
    }
}

fn to_int(value: &Value) -> Option<i32> {
    let wide = match value {
        Value::Integer(i) => *i,
        Value::Number(n) if n.fract() == 0.0 && n.is_finite() => {
            if *n < i64::MIN as f64 || *n > i64::MAX as f64 {
                return None;
            }
            *n as i64
        }
        Value::String(s) => {
            let s = s.to_str().ok()?;
            let s = s.trim();
            match s.parse::<i64>() {
                Ok(i) => i,
                Err(_) => {
                    let n = s.parse::<f64>().ok()?;
                    return to_int(&Value::Number(n));
                }
            }
        }
        _ => return None,
    };
    i32::try_from(wide).ok()
}

fn to_float(value: &Value) -> Option<f32> {
    match value {
        Value::Integer(i) => Some(*i as f32),
        Value::Number(n) => Some(*n as f32),
        Value::String(s) => s.to_str().ok()?.trim().parse::<f64>().ok().map(|n| n as f32),
        _ => None,
    }
}
