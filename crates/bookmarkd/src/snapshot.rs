use crate::types::{Node, Tree};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Human-diffable export of the tree, committed next to the database
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot<'a> {
    pub schema_version: u32,
    pub generated_at: i64,
    pub version: &'a str,
    pub root_id: &'a str,
    pub nodes: &'a BTreeMap<String, Node>,
    /// Every node has an entry; bookmarks and empty folders map to `[]`
    pub children: BTreeMap<&'a str, &'a [String]>,
}

impl<'a> Snapshot<'a> {
    pub fn new(tree: &'a Tree, generated_at: i64) -> Self {
        let children = tree
            .nodes
            .keys()
            .map(|id| (id.as_str(), tree.children_of(id)))
            .collect();
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            generated_at,
            version: &tree.version,
            root_id: &tree.root_id,
            nodes: &tree.nodes,
            children,
        }
    }
}

/// Write the snapshot atomically: a sibling temp file renamed into place
pub fn write_snapshot(path: &Path, tree: &Tree, generated_at: i64) -> std::io::Result<()> {
    let snapshot = Snapshot::new(tree, generated_at);
    let mut bytes = serde_json::to_vec_pretty(&snapshot)?;
    bytes.push(b'\n');

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}
