//! Integration tests for faction script hooks driven by event nodes.

mod common;

use common::{host_with_add, through_file};
use scripthost::{FactionScripts, Node, ScriptError, ScriptHost};

const FACTION_JSON: &str = r#"{
  "name": "faction",
  "attributes": [["name", "magic"]],
  "children": [
    {
      "name": "scripts",
      "children": [
        { "name": "script", "attributes": [["name", "startup"]], "text": "mana = 100 kills = 0" },
        { "name": "script", "attributes": [["name", "unitDied_dragon"]], "text": "kills = add(kills, 1)" },
        { "name": "script", "attributes": [["name", "resourceAmountBelowLimit_gold"]], "text": "os.exit(1)" }
      ]
    }
  ]
}"#;

#[test]
fn test_faction_document_drives_hooks() {
    let faction = FactionScripts::from_node(&Node::from_json(FACTION_JSON).unwrap()).unwrap();
    assert_eq!(faction.name(), "magic");
    assert_eq!(faction.script_count(), 3);

    let mut host = host_with_add();
    faction.install(&mut host).unwrap();

    assert!(FactionScripts::fire(&mut host, &Node::new("startup")).unwrap());
    let died = Node::new("unitDied").with_attribute("unit", "dragon");
    for _ in 0..3 {
        assert!(FactionScripts::fire(&mut host, &died).unwrap());
    }
    let (mana, kills): (i64, i64) = host.eval("return mana, kills").unwrap();
    assert_eq!((mana, kills), (100, 3));

    // No hook for this unit type.
    let other = Node::new("unitDied").with_attribute("unit", "worker");
    assert!(!FactionScripts::fire(&mut host, &other).unwrap());
}

#[test]
fn test_sandboxed_hook_can_not_reach_os() {
    let faction = FactionScripts::from_node(&Node::from_json(FACTION_JSON).unwrap()).unwrap();
    let mut host = host_with_add();
    faction.install(&mut host).unwrap();

    let event = Node::new("resourceAmountBelowLimit").with_attribute("resource", "gold");
    let err = FactionScripts::fire(&mut host, &event).unwrap_err();
    assert!(matches!(err, ScriptError::Runtime { .. }));
}

#[test]
fn test_hook_state_survives_save_and_restore() {
    let faction = FactionScripts::from_node(&Node::from_json(FACTION_JSON).unwrap()).unwrap();
    let died = Node::new("unitDied").with_attribute("unit", "dragon");

    let mut host = host_with_add();
    faction.install(&mut host).unwrap();
    FactionScripts::fire(&mut host, &Node::new("startup")).unwrap();
    FactionScripts::fire(&mut host, &died).unwrap();
    FactionScripts::fire(&mut host, &died).unwrap();

    let mut root = Node::new("game").with_attribute("faction", "magic");
    host.save_game(&mut root).unwrap();
    let (_dir, _path, loaded) = through_file(&root);
    assert_eq!(loaded.attribute("faction"), Some("magic"));

    let mut restored = host_with_add();
    faction.install(&mut restored).unwrap();
    restored.load_game(&loaded).unwrap();
    FactionScripts::fire(&mut restored, &died).unwrap();

    assert_eq!(restored.eval::<i64>("return kills").unwrap(), 3);
    assert_eq!(restored.eval::<i64>("return mana").unwrap(), 100);
}

#[test]
fn test_unnamed_script_rejected() {
    let node = Node::from_json(
        r#"{"name":"faction","children":[{"name":"scripts","children":[{"name":"script","text":"x = 1"}]}]}"#,
    )
    .unwrap();
    assert!(matches!(
        FactionScripts::from_node(&node),
        Err(ScriptError::Config(_))
    ));
}

#[test]
fn test_trusted_host_runs_same_hooks() {
    let faction = FactionScripts::from_node(&Node::from_json(FACTION_JSON).unwrap()).unwrap();
    let mut host = ScriptHost::trusted().unwrap();
    common::register_add(&mut host);
    faction.install(&mut host).unwrap();

    FactionScripts::fire(&mut host, &Node::new("startup")).unwrap();
    FactionScripts::fire(&mut host, &Node::new("unitDied").with_attribute("unit", "dragon"))
        .unwrap();
    assert_eq!(host.eval::<i64>("return kills").unwrap(), 1);
}
