//! Faction-level script hooks.
//!
//! A faction definition carries named scripts:
//!
//! ```text
//! faction name="tech"
//!   scripts
//!     script name="unitDied"      (text: Lua statements)
//! ```
//!
//! Each script becomes a global function of the same name. Simulation events
//! are described by a node whose tag and attribute values form the function
//! name to invoke, e.g. `unitDied unit="archer"` calls `unitDied_archer`.

use tracing::debug;

use crate::document::Node;
use crate::script::ScriptHost;
use crate::{Result, ScriptError};

/// A named script from a faction definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactionScript {
    pub name: String,
    pub code: String,
}

/// Scripts declared by one faction.
#[derive(Debug, Clone, Default)]
pub struct FactionScripts {
    name: String,
    scripts: Vec<FactionScript>,
}

impl FactionScripts {
    pub fn new(name: impl Into<String>, scripts: Vec<FactionScript>) -> Self {
        Self {
            name: name.into(),
            scripts,
        }
    }

    /// Read the scripts of a `faction` node. A missing `scripts` child means
    /// the faction has none.
    pub fn from_node(node: &Node) -> Result<Self> {
        let name = node.attribute("name").unwrap_or_default().to_string();
        let mut scripts = Vec::new();

        if let Some(list) = node.child("scripts") {
            for script in list.children_named("script") {
                let script_name = script.attribute("name").ok_or_else(|| {
                    ScriptError::Config(format!("faction '{}': script without a name", name))
                })?;
                scripts.push(FactionScript {
                    name: script_name.to_string(),
                    code: script.text.clone(),
                });
            }
        }

        Ok(Self { name, scripts })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn script_count(&self) -> usize {
        self.scripts.len()
    }

    pub fn script(&self, index: usize) -> Option<&FactionScript> {
        self.scripts.get(index)
    }

    pub fn scripts(&self) -> &[FactionScript] {
        &self.scripts
    }

    /// Function name for an event node: the tag followed by `_<value>` for
    /// every attribute, in document order.
    pub fn function_name(node: &Node) -> String {
        let mut name = node.name.clone();
        for (_, value) in &node.attributes {
            name.push('_');
            name.push_str(value);
        }
        name
    }

    /// Load every script into `host` as a function of the script's name.
    pub fn install(&self, host: &mut ScriptHost) -> Result<()> {
        for script in &self.scripts {
            let code = format!("function {}()\n{}\nend\n", script.name, script.code);
            host.load(&code, &script.name)?;
        }
        debug!(faction = %self.name, scripts = self.scripts.len(), "Faction scripts installed");
        Ok(())
    }

    /// Invoke the hook an event node names.
    ///
    /// Returns `Ok(false)` when the faction does not define that hook.
    pub fn fire(host: &mut ScriptHost, event: &Node) -> Result<bool> {
        let function_name = Self::function_name(event);
        host.begin_call(&function_name)?;
        match host.end_call() {
            Ok(_) => Ok(true),
            Err(ScriptError::Lookup(_)) => {
                debug!(hook = %function_name, "No script defined for hook");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
