//! Saving and restoring script globals through a state document.
//!
//! Layout under the caller's root node:
//!
//! ```text
//! ScriptState version="2"
//!   Global name="score"
//!     Value type="integer" value="10"
//!   Global name="spawn"
//!     Value type="table" ref="1"
//!   Table id="1"
//!     Field keyType="integer" key="1"
//!       Value type="number" value="0.5"
//!     Field keyType="string" key="self"
//!       Value type="table" ref="1"
//! ```
//!
//! Every table is written once as a flat `Table` node and referenced by id,
//! so shared tables and cycles survive a round trip and the document depth
//! does not grow with table nesting. Strings that are not valid UTF-8 carry
//! `encoding="hex"` (`keyEncoding="hex"` for keys).

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::c_void;

use mlua::{Lua, Table, Value};
use tracing::{debug, warn};

use crate::document::Node;
use crate::{Result, ScriptError};

pub const STATE_NODE: &str = "ScriptState";
pub const STATE_VERSION: &str = "2";

const GLOBAL_NODE: &str = "Global";
const VALUE_NODE: &str = "Value";
const TABLE_NODE: &str = "Table";
const FIELD_NODE: &str = "Field";
const HEX: &str = "hex";

/// Serialize the globals of `env` that are not in `skip`.
pub fn save_globals(env: &Table, skip: &HashSet<String>) -> Result<Node> {
    let mut globals = Vec::new();
    for pair in env.pairs::<Value, Value>() {
        let (key, value) = pair.map_err(|e| ScriptError::runtime(e.to_string()))?;
        let Value::String(key) = key else {
            continue;
        };
        let Ok(name) = key.to_str().map(|s| s.to_string()) else {
            debug!("Skipping global with a non UTF-8 name");
            continue;
        };
        if !skip.contains(&name) {
            globals.push((name, value));
        }
    }
    globals.sort_by(|a, b| a.0.cmp(&b.0));

    let mut state = Node::new(STATE_NODE).with_attribute("version", STATE_VERSION);
    let mut encoder = Encoder::default();
    for (name, value) in globals {
        match encoder.encode(&value) {
            Some(encoded) => {
                state
                    .add_child(Node::new(GLOBAL_NODE).with_attribute("name", name))
                    .children
                    .push(encoded);
            }
            None => debug!(global = %name, kind = value.type_name(), "Skipping global"),
        }
    }

    while let Some((id, table)) = encoder.pending.pop_front() {
        let node = encoder.encode_fields(id, &table);
        state.children.push(node);
    }
    Ok(state)
}

/// Assigns table ids in discovery order and queues tables for writing.
#[derive(Default)]
struct Encoder {
    ids: HashMap<*const c_void, usize>,
    pending: VecDeque<(usize, Table)>,
}

impl Encoder {
    fn table_id(&mut self, table: &Table) -> usize {
        let next = self.ids.len() + 1;
        let id = *self.ids.entry(table.to_pointer()).or_insert(next);
        if id == next {
            self.pending.push_back((id, table.clone()));
        }
        id
    }

    fn encode(&mut self, value: &Value) -> Option<Node> {
        let node = Node::new(VALUE_NODE);
        let node = match value {
            Value::Boolean(b) => node
                .with_attribute("type", "boolean")
                .with_attribute("value", b.to_string()),
            Value::Integer(i) => node
                .with_attribute("type", "integer")
                .with_attribute("value", i.to_string()),
            Value::Number(n) => node
                .with_attribute("type", "number")
                .with_attribute("value", n.to_string()),
            Value::String(s) => {
                let node = node.with_attribute("type", "string");
                match s.to_str() {
                    Ok(text) => node.with_attribute("value", &*text),
                    Err(_) => node
                        .with_attribute("encoding", HEX)
                        .with_attribute("value", hex::encode(&*s.as_bytes())),
                }
            }
            Value::Table(table) => node
                .with_attribute("type", "table")
                .with_attribute("ref", self.table_id(table).to_string()),
            _ => return None,
        };
        Some(node)
    }

    fn encode_fields(&mut self, id: usize, table: &Table) -> Node {
        let mut int_fields = Vec::new();
        let mut str_fields = Vec::new();
        for pair in table.pairs::<Value, Value>() {
            let Ok((key, value)) = pair else {
                continue;
            };
            match key {
                Value::Integer(i) => int_fields.push((i, value)),
                Value::String(s) => str_fields.push((s.as_bytes().to_vec(), value)),
                other => debug!(kind = other.type_name(), "Skipping table key"),
            }
        }
        int_fields.sort_by_key(|(k, _)| *k);
        str_fields.sort_by(|a, b| a.0.cmp(&b.0));

        let mut node = Node::new(TABLE_NODE).with_attribute("id", id.to_string());
        for (key, value) in int_fields {
            let Some(encoded) = self.encode(&value) else {
                continue;
            };
            node.children.push(
                Node::new(FIELD_NODE)
                    .with_attribute("keyType", "integer")
                    .with_attribute("key", key.to_string())
                    .with_child(encoded),
            );
        }
        for (key, value) in str_fields {
            let Some(encoded) = self.encode(&value) else {
                continue;
            };
            let field = Node::new(FIELD_NODE).with_attribute("keyType", "string");
            let field = match String::from_utf8(key) {
                Ok(text) => field.with_attribute("key", text),
                Err(e) => field
                    .with_attribute("keyEncoding", HEX)
                    .with_attribute("key", hex::encode(e.as_bytes())),
            };
            node.children.push(field.with_child(encoded));
        }
        node
    }
}

/// Restore globals saved by [`save_globals`] into `env`.
///
/// Globals missing from the document keep their current value. Returns the
/// number of globals restored.
pub fn load_globals(lua: &Lua, env: &Table, root: &Node) -> Result<usize> {
    let Some(state) = root.child(STATE_NODE) else {
        debug!("No saved script state found");
        return Ok(0);
    };
    if state.attribute("version") != Some(STATE_VERSION) {
        warn!(
            version = state.attribute("version").unwrap_or("none"),
            "Unexpected script state version"
        );
    }

    // Create every table first so references resolve in any order.
    let mut tables = HashMap::new();
    for node in state.children_named(TABLE_NODE) {
        let Some(id) = node.attribute("id") else {
            warn!("Skipping saved table without an id");
            continue;
        };
        tables.insert(id, lua.create_table().map_err(lua_error)?);
    }

    for node in state.children_named(TABLE_NODE) {
        let Some(table) = node.attribute("id").and_then(|id| tables.get(id)) else {
            continue;
        };
        for field in node.children_named(FIELD_NODE) {
            let Some(encoded) = field.child(VALUE_NODE) else {
                continue;
            };
            let Some(value) = decode_value(lua, encoded, &tables)? else {
                continue;
            };
            let key = field.attribute("key").unwrap_or("");
            match field.attribute("keyType") {
                Some("integer") => table
                    .raw_set(parse::<i64>(key, "integer key")?, value)
                    .map_err(lua_error)?,
                Some("string") => {
                    let key = decode_string(lua, key, field.attribute("keyEncoding"))?;
                    table.raw_set(key, value).map_err(lua_error)?
                }
                other => warn!(key_type = ?other, "Skipping field with unknown key type"),
            }
        }
    }

    let mut restored = 0;
    for global in state.children_named(GLOBAL_NODE) {
        let Some(name) = global.attribute("name") else {
            warn!("Skipping saved global without a name");
            continue;
        };
        let Some(encoded) = global.child(VALUE_NODE) else {
            continue;
        };
        if let Some(value) = decode_value(lua, encoded, &tables)? {
            env.raw_set(name, value).map_err(lua_error)?;
            restored += 1;
        }
    }
    Ok(restored)
}

fn decode_value(lua: &Lua, node: &Node, tables: &HashMap<&str, Table>) -> Result<Option<Value>> {
    let kind = node.attribute("type").unwrap_or("");
    let scalar = || {
        node.attribute("value")
            .ok_or_else(|| ScriptError::Load(format!("saved {} value is missing", kind)))
    };

    let value = match kind {
        "boolean" => Value::Boolean(parse(scalar()?, kind)?),
        "integer" => Value::Integer(parse(scalar()?, kind)?),
        "number" => Value::Number(parse(scalar()?, kind)?),
        "string" => Value::String(decode_string(lua, scalar()?, node.attribute("encoding"))?),
        "table" => {
            let reference = node.attribute("ref").unwrap_or("");
            match tables.get(reference) {
                Some(table) => Value::Table(table.clone()),
                None => {
                    warn!(reference, "Skipping reference to a table that was not saved");
                    return Ok(None);
                }
            }
        }
        other => {
            warn!(kind = other, "Skipping saved value of unknown type");
            return Ok(None);
        }
    };
    Ok(Some(value))
}

fn decode_string(lua: &Lua, raw: &str, encoding: Option<&str>) -> Result<mlua::String> {
    let bytes = match encoding {
        None => raw.as_bytes().to_vec(),
        Some(HEX) => hex::decode(raw)
            .map_err(|_| ScriptError::Load(format!("invalid saved hex string '{}'", raw)))?,
        Some(other) => {
            return Err(ScriptError::Load(format!(
                "unknown saved string encoding '{}'",
                other
            )))
        }
    };
    lua.create_string(bytes).map_err(lua_error)
}

fn parse<T: std::str::FromStr>(raw: &str, kind: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| ScriptError::Load(format!("invalid saved {} '{}'", kind, raw)))
}

fn lua_error(e: mlua::Error) -> ScriptError {
    ScriptError::Load(format!("failed to restore script state: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved(lua: &Lua, code: &str) -> Node {
        let env = lua.create_table().unwrap();
        lua.load(code).set_environment(env.clone()).exec().unwrap();
        save_globals(&env, &HashSet::new()).unwrap()
    }

    /// Save `code`'s globals, reload them through JSON into a fresh state and
    /// evaluate `check` there.
    fn round_trip<R: mlua::FromLuaMulti>(code: &str, check: &str) -> R {
        let lua = Lua::new();
        let mut root = Node::new("game");
        root.children.push(saved(&lua, code));
        let root = Node::from_json(&root.to_json().unwrap()).unwrap();

        let fresh = Lua::new();
        let env = fresh.create_table().unwrap();
        for name in ["rawequal", "next"] {
            env.raw_set(name, fresh.globals().get::<Value>(name).unwrap())
                .unwrap();
        }
        load_globals(&fresh, &env, &root).unwrap();
        fresh.load(check).set_environment(env).eval().unwrap()
    }

    #[test]
    fn test_scalar_layout() {
        let lua = Lua::new();
        let state = saved(&lua, "b = 2 a = 'x' c = true d = 0.5");

        assert_eq!(state.name, STATE_NODE);
        let names: Vec<_> = state
            .children
            .iter()
            .map(|g| g.attribute("name").unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);

        let b = state.children[1].child(VALUE_NODE).unwrap();
        assert_eq!(b.attribute("type"), Some("integer"));
        assert_eq!(b.attribute("value"), Some("2"));
    }

    #[test]
    fn test_tables_are_flat() {
        let lua = Lua::new();
        let state = saved(&lua, "t = { inner = { 1 } }");

        let t = state.children[0].child(VALUE_NODE).unwrap();
        assert_eq!(t.attribute("type"), Some("table"));
        assert_eq!(t.attribute("ref"), Some("1"));

        let tables: Vec<_> = state.children_named(TABLE_NODE).collect();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].attribute("id"), Some("1"));
        let inner = tables[0].children[0].child(VALUE_NODE).unwrap();
        assert_eq!(inner.attribute("ref"), Some("2"));
        assert!(inner.children.is_empty());
    }

    #[test]
    fn test_functions_and_skip_list_excluded() {
        let lua = Lua::new();
        let env = lua.create_table().unwrap();
        lua.load("f = function() end keep = 1 builtin = 2")
            .set_environment(env.clone())
            .exec()
            .unwrap();
        let skip: HashSet<String> = ["builtin".to_string()].into_iter().collect();

        let state = save_globals(&env, &skip).unwrap();
        assert_eq!(state.children.len(), 1);
        assert_eq!(state.children[0].attribute("name"), Some("keep"));
    }

    #[test]
    fn test_round_trip_into_fresh_environment() {
        let lua = Lua::new();
        let state = saved(
            &lua,
            "n = -0.1 s = 'hi' t = { 1, 2, nested = { ok = true }, [10] = 'ten' }",
        );
        let mut root = Node::new("game");
        root.children.push(state);

        let fresh = Lua::new();
        let env = fresh.create_table().unwrap();
        assert_eq!(load_globals(&fresh, &env, &root).unwrap(), 3);

        let (n, s, second, ok, ten): (f64, String, i64, bool, String) = fresh
            .load("return n, s, t[2], t.nested.ok, t[10]")
            .set_environment(env)
            .eval()
            .unwrap();
        assert_eq!(n, -0.1);
        assert_eq!(s, "hi");
        assert_eq!(second, 2);
        assert!(ok);
        assert_eq!(ten, "ten");
    }

    #[test]
    fn test_edge_numbers_round_trip() {
        let (nan, inf, neg_inf, neg_zero, min, max): (f64, f64, f64, f64, i64, i64) = round_trip(
            "nan = 0/0 inf = 1/0 ninf = -1/0 nz = -0.0 \
             min = -9223372036854775807 - 1 max = 9223372036854775807",
            "return nan, inf, ninf, nz, min, max",
        );
        assert!(nan.is_nan());
        assert_eq!(inf, f64::INFINITY);
        assert_eq!(neg_inf, f64::NEG_INFINITY);
        assert_eq!(neg_zero, 0.0);
        assert!(neg_zero.is_sign_negative());
        assert_eq!(min, i64::MIN);
        assert_eq!(max, i64::MAX);
    }

    #[test]
    fn test_integer_and_float_subtypes_kept() {
        let lua = Lua::new();
        let state = saved(&lua, "i = 3 f = 3.0");
        let f = state.children[0].child(VALUE_NODE).unwrap();
        let i = state.children[1].child(VALUE_NODE).unwrap();
        assert_eq!(f.attribute("type"), Some("number"));
        assert_eq!(i.attribute("type"), Some("integer"));
    }

    #[test]
    fn test_empty_values_and_mixed_keys_round_trip() {
        let (empty_string, empty_len, first, label, last): (String, i64, i64, String, i64) =
            round_trip(
                "e = '' t = {} m = { 10, 20, [-5] = 7, label = 'mixed' }",
                "return e, #t + (next(t) == nil and 0 or 1), m[1], m.label, m[-5]",
            );
        assert_eq!(empty_string, "");
        assert_eq!(empty_len, 0);
        assert_eq!(first, 10);
        assert_eq!(label, "mixed");
        assert_eq!(last, 7);
    }

    #[test]
    fn test_non_utf8_strings_round_trip() {
        let lua = Lua::new();
        let state = saved(&lua, "x = '\\xff\\xfe' t = { ['\\xc3'] = 'key' }");
        let x = state.children[1].child(VALUE_NODE).unwrap();
        assert_eq!(x.attribute("encoding"), Some("hex"));
        assert_eq!(x.attribute("value"), Some("fffe"));

        let (x, key): (mlua::String, String) =
            round_trip("x = '\\xff\\xfe' t = { ['\\xc3'] = 'key' }", "return x, t['\\xc3']");
        assert_eq!(x.as_bytes().to_vec(), vec![0xff, 0xfe]);
        assert_eq!(key, "key");
    }

    #[test]
    fn test_shared_tables_and_cycles_round_trip() {
        let (same, cyclic, n): (bool, bool, i64) = round_trip(
            "a = { n = 1 } b = a c = { } c.self = c a.back = c",
            "return rawequal(a, b), rawequal(c.self, c) and rawequal(a.back, c), b.n",
        );
        assert!(same);
        assert!(cyclic);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_deep_nesting_round_trips_through_json() {
        let depth: i64 = round_trip(
            "t = {} local c = t for i = 1, 20000 do c.n = {} c = c.n end",
            "local c, d = t, 0 while c.n do c = c.n d = d + 1 end return d",
        );
        assert_eq!(depth, 20000);
    }

    #[test]
    fn test_missing_state_is_tolerated() {
        let lua = Lua::new();
        let env = lua.create_table().unwrap();
        assert_eq!(load_globals(&lua, &env, &Node::new("game")).unwrap(), 0);
    }

    #[test]
    fn test_unknown_type_skipped_and_bad_scalar_rejected() {
        let lua = Lua::new();
        let env = lua.create_table().unwrap();

        let unknown = Node::new("game").with_child(
            Node::new(STATE_NODE)
                .with_attribute("version", STATE_VERSION)
                .with_child(
                    Node::new(GLOBAL_NODE)
                        .with_attribute("name", "u")
                        .with_child(Node::new(VALUE_NODE).with_attribute("type", "userdata")),
                )
                .with_child(
                    Node::new(GLOBAL_NODE).with_attribute("name", "dangling").with_child(
                        Node::new(VALUE_NODE)
                            .with_attribute("type", "table")
                            .with_attribute("ref", "9"),
                    ),
                ),
        );
        assert_eq!(load_globals(&lua, &env, &unknown).unwrap(), 0);

        let bad = Node::new("game").with_child(
            Node::new(STATE_NODE).with_child(
                Node::new(GLOBAL_NODE).with_attribute("name", "x").with_child(
                    Node::new(VALUE_NODE)
                        .with_attribute("type", "integer")
                        .with_attribute("value", "ten"),
                ),
            ),
        );
        assert!(matches!(
            load_globals(&lua, &env, &bad),
            Err(ScriptError::Load(_))
        ));
    }
}
