//! Test helpers for script host integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use scripthost::{Node, ScriptHost};
use tempfile::TempDir;

/// Sandboxed host with the `add(a, b)` native registered.
pub fn host_with_add() -> ScriptHost {
    let mut host = ScriptHost::sandboxed().expect("sandboxed host");
    register_add(&mut host);
    host
}

/// Register `add(a, b)` returning the integer sum.
pub fn register_add(host: &mut ScriptHost) {
    host.register_function("add", |args| {
        let sum = args.get_int(0)? + args.get_int(1)?;
        args.return_int(sum);
        Ok(1)
    })
    .expect("register add");
}

/// Save `root` to a file in a fresh temporary directory and read it back.
///
/// The directory is returned so the file outlives the call.
pub fn through_file(root: &Node) -> (TempDir, PathBuf, Node) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("save.json");
    root.save(&path).expect("save document");
    let loaded = Node::load(&path).expect("load document");
    (dir, path, loaded)
}
