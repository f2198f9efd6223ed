use crate::order::insertion_position;
use crate::types::{NodeKind, Operation, ROOT_ID, Tab, Tree};
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

/// A structural rule violated by one operation of a batch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid parent: {parent_id}")]
    InvalidParent { parent_id: String },
    #[error("invalid index {index} (allowed 0..={max})")]
    InvalidIndex { index: i64, max: usize },
    #[error("invalid url: {url:?}")]
    InvalidUrl { url: String },
    #[error("invalid node: {node_id}")]
    InvalidNode { node_id: String },
    #[error("root node is immutable")]
    RootImmutable,
    #[error("cycle detected moving {node_id} under {new_parent_id}")]
    CycleDetected {
        node_id: String,
        new_parent_id: String,
    },
}

impl ValidationError {
    /// Machine-readable rule name
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::InvalidParent { .. } => "invalid_parent",
            ValidationError::InvalidIndex { .. } => "invalid_index",
            ValidationError::InvalidUrl { .. } => "invalid_url",
            ValidationError::InvalidNode { .. } => "invalid_node",
            ValidationError::RootImmutable => "root_immutable",
            ValidationError::CycleDetected { .. } => "cycle_detected",
        }
    }
}

/// First failing operation of a rejected batch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation {op_index} ({op}): {error}")]
pub struct ValidationFailure {
    pub op_index: usize,
    pub op: &'static str,
    #[source]
    pub error: ValidationError,
}

/// Check a bookmark url: non-empty, parseable, http or https
pub fn validate_url(raw: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidUrl {
        url: raw.to_string(),
    };
    if raw.trim().is_empty() {
        return Err(invalid());
    }
    let parsed = Url::parse(raw).map_err(|_| invalid())?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(invalid()),
    }
}

/// Pre-flight check of a batch against a snapshot
///
/// Operations are checked in order against a projection that absorbs the
/// effect of each accepted operation, so later operations see earlier ones.
/// Stops at the first failure. Never touches storage.
pub fn validate_ops(tree: &Tree, ops: &[Operation]) -> Result<(), ValidationFailure> {
    let mut projection = Projection::from_tree(tree);
    for (op_index, op) in ops.iter().enumerate() {
        projection.apply(op).map_err(|error| ValidationFailure {
            op_index,
            op: op.name(),
            error,
        })?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct ProjectedNode {
    kind: NodeKind,
    parent: Option<String>,
}

/// Mutable node table plus per-parent child lists
struct Projection {
    nodes: HashMap<String, ProjectedNode>,
    children: HashMap<String, Vec<String>>,
    pending: usize,
}

impl Projection {
    fn from_tree(tree: &Tree) -> Self {
        let nodes = tree
            .nodes
            .values()
            .map(|n| {
                (
                    n.id.clone(),
                    ProjectedNode {
                        kind: n.kind,
                        parent: n.parent_id.clone(),
                    },
                )
            })
            .collect();
        let children = tree
            .children
            .iter()
            .map(|(parent, ids)| (parent.clone(), ids.clone()))
            .collect();
        Self {
            nodes,
            children,
            pending: 0,
        }
    }

    fn apply(&mut self, op: &Operation) -> Result<(), ValidationError> {
        match op {
            Operation::AddFolder {
                parent_id, index, ..
            } => {
                self.check_parent(parent_id)?;
                self.check_index(parent_id, *index, None)?;
                self.insert_pending(parent_id, NodeKind::Folder, *index);
            }
            Operation::AddBookmark {
                parent_id,
                url,
                index,
                ..
            } => {
                self.check_parent(parent_id)?;
                self.check_index(parent_id, *index, None)?;
                validate_url(url)?;
                self.insert_pending(parent_id, NodeKind::Bookmark, *index);
            }
            Operation::RenameNode { node_id, .. } => {
                self.check_mutable(node_id)?;
            }
            Operation::MoveNode {
                node_id,
                new_parent_id,
                new_index,
            } => {
                self.check_mutable(node_id)?;
                if new_parent_id == node_id || self.is_descendant(new_parent_id, node_id) {
                    return Err(ValidationError::CycleDetected {
                        node_id: node_id.clone(),
                        new_parent_id: new_parent_id.clone(),
                    });
                }
                self.check_parent(new_parent_id)?;
                self.check_index(new_parent_id, *new_index, Some(node_id))?;
                self.relink(node_id, new_parent_id, *new_index);
            }
            Operation::DeleteNode { node_id, .. } => {
                self.check_mutable(node_id)?;
                self.remove_subtree(node_id);
            }
            Operation::UpdateBookmark { node_id, url, .. } => {
                let node = self.check_mutable(node_id)?;
                if node.kind != NodeKind::Bookmark {
                    return Err(ValidationError::InvalidNode {
                        node_id: node_id.clone(),
                    });
                }
                if let Some(url) = url {
                    validate_url(url)?;
                }
            }
            Operation::SaveSession {
                parent_id,
                tabs,
                index,
                ..
            } => {
                self.check_parent(parent_id)?;
                self.check_index(parent_id, *index, None)?;
                for Tab { url, .. } in tabs {
                    validate_url(url)?;
                }
                let folder = self.insert_pending(parent_id, NodeKind::Folder, *index);
                for _ in tabs {
                    self.insert_pending(&folder, NodeKind::Bookmark, None);
                }
            }
        }
        Ok(())
    }

    fn check_parent(&self, parent_id: &str) -> Result<(), ValidationError> {
        match self.nodes.get(parent_id) {
            Some(node) if node.kind == NodeKind::Folder => Ok(()),
            _ => Err(ValidationError::InvalidParent {
                parent_id: parent_id.to_string(),
            }),
        }
    }

    /// `exclude` is left out of the sibling count (a node moving within its
    /// own parent)
    fn check_index(
        &self,
        parent_id: &str,
        index: Option<i64>,
        exclude: Option<&str>,
    ) -> Result<(), ValidationError> {
        let Some(index) = index else {
            return Ok(());
        };
        let max = self.sibling_count(parent_id, exclude);
        if index < 0 || index as u64 > max as u64 {
            return Err(ValidationError::InvalidIndex { index, max });
        }
        Ok(())
    }

    fn check_mutable(&self, node_id: &str) -> Result<&ProjectedNode, ValidationError> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| ValidationError::InvalidNode {
                node_id: node_id.to_string(),
            })?;
        if node_id == ROOT_ID {
            return Err(ValidationError::RootImmutable);
        }
        Ok(node)
    }

    fn sibling_count(&self, parent_id: &str, exclude: Option<&str>) -> usize {
        self.children
            .get(parent_id)
            .map(|ids| ids.iter().filter(|id| Some(id.as_str()) != exclude).count())
            .unwrap_or(0)
    }

    /// True when `candidate` has `ancestor` somewhere above it
    fn is_descendant(&self, candidate: &str, ancestor: &str) -> bool {
        let mut current = self.nodes.get(candidate).and_then(|n| n.parent.clone());
        let mut steps = 0;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.nodes.len() {
                // Corrupt snapshot; treat as a cycle rather than spin
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent.clone());
        }
        false
    }

    fn insert_pending(&mut self, parent_id: &str, kind: NodeKind, index: Option<i64>) -> String {
        self.pending += 1;
        let id = format!("pending:{}", self.pending);
        self.nodes.insert(
            id.clone(),
            ProjectedNode {
                kind,
                parent: Some(parent_id.to_string()),
            },
        );
        self.attach(&id, parent_id, index);
        id
    }

    fn attach(&mut self, node_id: &str, parent_id: &str, index: Option<i64>) {
        let siblings = self.children.entry(parent_id.to_string()).or_default();
        let pos = insertion_position(siblings.len(), index);
        siblings.insert(pos, node_id.to_string());
    }

    fn detach(&mut self, node_id: &str) {
        let parent = self.nodes.get(node_id).and_then(|n| n.parent.clone());
        if let Some(siblings) = parent.and_then(|p| self.children.get_mut(&p)) {
            siblings.retain(|id| id != node_id);
        }
    }

    fn relink(&mut self, node_id: &str, new_parent_id: &str, index: Option<i64>) {
        self.detach(node_id);
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.parent = Some(new_parent_id.to_string());
        }
        self.attach(node_id, new_parent_id, index);
    }

    fn remove_subtree(&mut self, node_id: &str) {
        self.detach(node_id);
        let mut stack = vec![node_id.to_string()];
        while let Some(id) = stack.pop() {
            self.nodes.remove(&id);
            if let Some(kids) = self.children.remove(&id) {
                stack.extend(kids);
            }
        }
    }
}
