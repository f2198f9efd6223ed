use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Id of the single distinguished root folder
pub const ROOT_ID: &str = "root";

/// Version tag of a tree that has never been committed to the VCS
pub const UNINITIALIZED_VERSION: &str = "uninitialized";

pub const DEFAULT_SEARCH_LIMIT: usize = 50;
pub const MAX_SEARCH_LIMIT: usize = 500;

/// Generate a new node id
///
/// UUIDv7 in simple (32 lowercase hex chars) form: the leading 48 bits are the
/// millisecond timestamp, so ids sort lexicographically by creation time.
pub fn new_node_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Current wall clock in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Closed set of node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    Bookmark,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Folder => "folder",
            NodeKind::Bookmark => "bookmark",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = NodeKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "folder" => Ok(NodeKind::Folder),
            "bookmark" => Ok(NodeKind::Bookmark),
            other => Err(NodeKindError(other.to_string())),
        }
    }
}

/// Error returned when a stored kind string is not a known `NodeKind`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeKindError(pub String);

impl fmt::Display for NodeKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown node kind: {:?}", self.0)
    }
}

impl std::error::Error for NodeKindError {}

/// A folder or a bookmark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub parent_id: Option<String>,
    pub ord: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Node {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

/// Materialized snapshot of the bookmark tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tree {
    pub version: String,
    pub root_id: String,
    pub nodes: BTreeMap<String, Node>,
    /// Parent id -> child ids, ascending by (ord, id)
    #[serde(default)]
    pub children: BTreeMap<String, Vec<String>>,
}

impl Tree {
    /// Build a tree from a flat node list, deriving the ordered child lists
    pub fn from_nodes(version: impl Into<String>, nodes: impl IntoIterator<Item = Node>) -> Self {
        let nodes: BTreeMap<String, Node> = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in nodes.values() {
            if let Some(parent) = &node.parent_id {
                children.entry(parent.clone()).or_default().push(node.id.clone());
            }
        }
        for ids in children.values_mut() {
            ids.sort_by(|a, b| {
                let (na, nb) = (&nodes[a], &nodes[b]);
                na.ord.total_cmp(&nb.ord).then_with(|| na.id.cmp(&nb.id))
            });
        }

        Self {
            version: version.into(),
            root_id: ROOT_ID.to_string(),
            nodes,
            children,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn children_of(&self, id: &str) -> &[String] {
        self.children.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Ids added, removed or modified relative to `before`, sorted
    pub fn changed_since(&self, before: &Tree) -> Vec<String> {
        let mut changed = BTreeSet::new();
        for (id, node) in &self.nodes {
            match before.nodes.get(id) {
                Some(old) if old == node => {}
                _ => {
                    changed.insert(id.clone());
                }
            }
        }
        for id in before.nodes.keys() {
            if !self.nodes.contains_key(id) {
                changed.insert(id.clone());
            }
        }
        changed.into_iter().collect()
    }

    /// Case-insensitive substring match over title and url, in id order
    pub fn search(&self, query: &str, limit: usize) -> Vec<&Node> {
        let query = query.to_lowercase();
        self.nodes
            .values()
            .filter(|node| {
                query.is_empty()
                    || node.title.to_lowercase().contains(&query)
                    || node
                        .url
                        .as_deref()
                        .is_some_and(|u| u.to_lowercase().contains(&query))
            })
            .take(limit)
            .collect()
    }
}

/// Clamp a caller-supplied search limit to [1, MAX_SEARCH_LIMIT]
pub fn clamp_search_limit(limit: Option<i64>) -> usize {
    match limit {
        None => DEFAULT_SEARCH_LIMIT,
        Some(n) => n.clamp(1, MAX_SEARCH_LIMIT as i64) as usize,
    }
}

/// A browser tab captured by `SaveSession`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    #[serde(default)]
    pub title: String,
    pub url: String,
}

/// A single mutation intent within a batch
///
/// `index` is an optional 0-based position among the current siblings;
/// `None` appends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    #[serde(rename_all = "camelCase")]
    AddFolder {
        parent_id: String,
        #[serde(default)]
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    AddBookmark {
        parent_id: String,
        #[serde(default)]
        title: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    RenameNode {
        node_id: String,
        #[serde(default)]
        title: String,
    },
    #[serde(rename_all = "camelCase")]
    MoveNode {
        node_id: String,
        new_parent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_index: Option<i64>,
    },
    /// Deleting a folder always cascades; `recursive` is carried for
    /// clients that send it.
    #[serde(rename_all = "camelCase")]
    DeleteNode {
        node_id: String,
        #[serde(default)]
        recursive: bool,
    },
    #[serde(rename_all = "camelCase")]
    UpdateBookmark {
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SaveSession {
        parent_id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        tabs: Vec<Tab>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<i64>,
    },
}

impl Operation {
    /// Wire name of the operation
    pub fn name(&self) -> &'static str {
        match self {
            Operation::AddFolder { .. } => "add_folder",
            Operation::AddBookmark { .. } => "add_bookmark",
            Operation::RenameNode { .. } => "rename_node",
            Operation::MoveNode { .. } => "move_node",
            Operation::DeleteNode { .. } => "delete_node",
            Operation::UpdateBookmark { .. } => "update_bookmark",
            Operation::SaveSession { .. } => "save_session",
        }
    }
}
