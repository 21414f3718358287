//! Branching Conversation Tree
//!
//! The client-side mirror of a server-authoritative conversation: a tree of
//! messages where any node may have multiple alternative continuations
//! ("branches"), exactly one of which is active at a time. This module is
//! pure data structure and algorithms — no network, no timers. All remote
//! coordination lives in the gateway.
//!
//! # Invariants
//!
//! For every structurally valid tree:
//!
//! - A node's `parent_id`, if set, references an existing node whose
//!   `child_ids` contains this node's id exactly once.
//! - `active_child_index`, if set, is a valid index into `child_ids`, and is
//!   unset iff the node has no children.
//! - Exactly one node (the root) has no parent; every node is reachable from
//!   it and the tree is acyclic.
//! - `tail_id` is the leaf reached by following `active_child_index` from the
//!   root. It is re-derived after every mutation and never independently
//!   authoritative.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::speaker::SpeakerId;

/// Current Unix timestamp in milliseconds
pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Identifiers
// ============================================================================

/// Prefix marking ids the client invented and the server has not confirmed
pub const TEMP_ID_PREFIX: &str = "local-";

/// Node identifier
///
/// The server assigns the authoritative id once a node is confirmed. Until
/// then the client uses a temporary `local-` id, which the gateway rewrites
/// in place when the server ack arrives.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generate a fresh client-temporary id
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// Whether this id is client-temporary (never confirmed by the server)
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Client-generated correlation id
///
/// Stable across server id rewrites, so a node stays addressable while its
/// `NodeId` changes underneath it (e.g. the streaming placeholder during
/// create/cancel races).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new unique client id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Tree-algebra errors
///
/// These are always local and synchronous. They indicate a caller bug or a
/// stale reference and are never retried or recovered internally.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TreeError {
    /// The requested parent node does not exist
    #[error("unknown parent node: {0}")]
    UnknownParent(NodeId),
    /// The requested node does not exist
    #[error("node not found: {0}")]
    NotFound(NodeId),
    /// The root node cannot be deleted
    #[error("cannot delete the root node")]
    CannotDeleteRoot,
    /// A node with this id is already present
    #[error("duplicate node id: {0}")]
    DuplicateNode(NodeId),
    /// A server payload failed structural validation during rehydration
    #[error("malformed tree: {0}")]
    Malformed(String),
}

// ============================================================================
// Nodes
// ============================================================================

/// A single message node in the conversation tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatNode {
    /// Node identity (server-assigned once confirmed, `local-` before)
    pub id: NodeId,
    /// Client correlation id, stable across id rewrites
    pub client_id: ClientId,
    /// Parent node (None only for the root)
    pub parent_id: Option<NodeId>,
    /// Ordered children; insertion order is branch order
    pub child_ids: Vec<NodeId>,
    /// Index of the active branch in `child_ids` (None iff no children)
    pub active_child_index: Option<usize>,
    /// Who authored this message
    pub speaker_id: SpeakerId,
    /// Message text
    pub message: String,
    /// Whether the message was produced by a bot
    pub is_bot: bool,
    /// Creation time (Unix timestamp ms)
    pub created_at: u64,
    /// Last edit time (Unix timestamp ms), unset until the first edit
    pub updated_at: Option<u64>,
}

impl ChatNode {
    /// Create a new leaf node
    pub fn new(
        id: NodeId,
        client_id: ClientId,
        parent_id: Option<NodeId>,
        speaker_id: SpeakerId,
        message: impl Into<String>,
        is_bot: bool,
    ) -> Self {
        Self {
            id,
            client_id,
            parent_id,
            child_ids: Vec::new(),
            active_child_index: None,
            speaker_id,
            message: message.into(),
            is_bot,
            created_at: now_ms(),
            updated_at: None,
        }
    }

    /// Create a root node (no parent)
    pub fn root(id: NodeId, speaker_id: SpeakerId, message: impl Into<String>) -> Self {
        Self::new(id, ClientId::new(), None, speaker_id, message, false)
    }

    /// The currently active child id, if any
    #[must_use]
    pub fn active_child(&self) -> Option<&NodeId> {
        self.active_child_index.and_then(|i| self.child_ids.get(i))
    }
}

// ============================================================================
// Tree
// ============================================================================

/// The conversation tree aggregate
///
/// Created wholesale on chat load, mutated exclusively through the four tree
/// operations, and replaced (never destroyed) on chat switch. The gateway is
/// the single writer; everything else reads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTree {
    nodes: HashMap<NodeId, ChatNode>,
    root_id: NodeId,
    tail_id: NodeId,
}

impl ChatTree {
    /// Create a tree containing only the given root node
    ///
    /// Any parent reference on the node is cleared.
    #[must_use]
    pub fn new(mut root: ChatNode) -> Self {
        root.parent_id = None;
        let root_id = root.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), root);
        Self {
            nodes,
            root_id: root_id.clone(),
            tail_id: root_id,
        }
    }

    /// Rehydrate a tree from the server's flat node list
    ///
    /// Validates the structural invariants (single root, parent/child
    /// symmetry, valid active indices, full reachability) and recomputes the
    /// tail. The payload is rejected, not repaired.
    pub fn from_nodes(nodes: Vec<ChatNode>) -> Result<Self, TreeError> {
        let mut map: HashMap<NodeId, ChatNode> = HashMap::with_capacity(nodes.len());
        let mut root_id = None;

        for node in nodes {
            if node.parent_id.is_none() {
                if root_id.is_some() {
                    return Err(TreeError::Malformed("more than one root node".to_string()));
                }
                root_id = Some(node.id.clone());
            }
            let id = node.id.clone();
            if map.insert(id.clone(), node).is_some() {
                return Err(TreeError::DuplicateNode(id));
            }
        }

        let root_id = root_id.ok_or_else(|| TreeError::Malformed("no root node".to_string()))?;

        for node in map.values() {
            if let Some(parent_id) = &node.parent_id {
                let parent = map.get(parent_id).ok_or_else(|| {
                    TreeError::Malformed(format!("node {} references missing parent {parent_id}", node.id))
                })?;
                let refs = parent.child_ids.iter().filter(|c| **c == node.id).count();
                if refs != 1 {
                    return Err(TreeError::Malformed(format!(
                        "parent {parent_id} lists child {} {refs} times",
                        node.id
                    )));
                }
            }
            for child_id in &node.child_ids {
                let child = map.get(child_id).ok_or_else(|| {
                    TreeError::Malformed(format!("node {} lists missing child {child_id}", node.id))
                })?;
                if child.parent_id.as_ref() != Some(&node.id) {
                    return Err(TreeError::Malformed(format!(
                        "child {child_id} does not point back at parent {}",
                        node.id
                    )));
                }
            }
            match node.active_child_index {
                Some(i) if i >= node.child_ids.len() => {
                    return Err(TreeError::Malformed(format!(
                        "node {} has active index {i} but {} children",
                        node.id,
                        node.child_ids.len()
                    )));
                }
                None if !node.child_ids.is_empty() => {
                    return Err(TreeError::Malformed(format!(
                        "node {} has children but no active branch",
                        node.id
                    )));
                }
                _ => {}
            }
        }

        // Reachability doubles as the acyclicity check: parent/child symmetry
        // plus full coverage from a single root leaves no room for a cycle.
        let mut seen = HashSet::new();
        let mut queue = vec![root_id.clone()];
        while let Some(next) = queue.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(node) = map.get(&next) {
                queue.extend(node.child_ids.iter().cloned());
            }
        }
        if seen.len() != map.len() {
            return Err(TreeError::Malformed(format!(
                "{} of {} nodes unreachable from root",
                map.len() - seen.len(),
                map.len()
            )));
        }

        let mut tree = Self {
            nodes: map,
            root_id: root_id.clone(),
            tail_id: root_id,
        };
        tree.recompute_tail();
        Ok(tree)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The root node id
    #[must_use]
    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    /// The tail: the leaf of the active path
    #[must_use]
    pub fn tail_id(&self) -> &NodeId {
        &self.tail_id
    }

    /// Look up a node
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&ChatNode> {
        self.nodes.get(id)
    }

    /// Mutable node access for reconciliation paths
    pub(crate) fn get_mut(&mut self, id: &NodeId) -> Option<&mut ChatNode> {
        self.nodes.get_mut(id)
    }

    /// Whether a node exists
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes (including the root)
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// A tree always contains at least the root
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Find a node by its client correlation id
    ///
    /// Survives server id rewrites; used to locate the streaming placeholder
    /// regardless of whether its create has been confirmed yet.
    #[must_use]
    pub fn find_by_client_id(&self, client_id: ClientId) -> Option<&ChatNode> {
        self.nodes.values().find(|n| n.client_id == client_id)
    }

    /// The active path from root to tail, in order
    #[must_use]
    pub fn active_path(&self) -> Vec<NodeId> {
        let mut path = vec![self.root_id.clone()];
        let mut current = self.root_id.clone();
        while let Some(next) = self.nodes.get(&current).and_then(ChatNode::active_child) {
            path.push(next.clone());
            current = next.clone();
        }
        path
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Insert a node as the newest child of `parent_id`
    ///
    /// The new branch becomes the parent's active choice.
    pub fn add_node(&mut self, parent_id: &NodeId, mut node: ChatNode) -> Result<(), TreeError> {
        if self.nodes.contains_key(&node.id) {
            return Err(TreeError::DuplicateNode(node.id));
        }
        let parent = self
            .nodes
            .get_mut(parent_id)
            .ok_or_else(|| TreeError::UnknownParent(parent_id.clone()))?;

        node.parent_id = Some(parent_id.clone());
        parent.child_ids.push(node.id.clone());
        parent.active_child_index = Some(parent.child_ids.len() - 1);
        self.nodes.insert(node.id.clone(), node);
        self.recompute_tail();
        Ok(())
    }

    /// Replace a node's message text and bump its `updated_at`
    pub fn edit_content(&mut self, id: &NodeId, content: &str) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| TreeError::NotFound(id.clone()))?;
        node.message = content.to_string();
        node.updated_at = Some(now_ms());
        self.recompute_tail();
        Ok(())
    }

    /// Remove a node and its entire subtree
    ///
    /// The parent's child list is repaired: if the removed branch was active,
    /// the active index clamps to `min(previous_index, new_len - 1)` (or
    /// clears when no children remain); removing an earlier sibling shifts
    /// the index down so it keeps addressing the same surviving child.
    pub fn delete_subtree(&mut self, id: &NodeId) -> Result<(), TreeError> {
        if !self.nodes.contains_key(id) {
            return Err(TreeError::NotFound(id.clone()));
        }
        if *id == self.root_id {
            return Err(TreeError::CannotDeleteRoot);
        }

        // Closure of the doomed subtree
        let mut doomed = Vec::new();
        let mut queue = vec![id.clone()];
        while let Some(next) = queue.pop() {
            if let Some(node) = self.nodes.get(&next) {
                queue.extend(node.child_ids.iter().cloned());
            }
            doomed.push(next);
        }

        let parent_id = self.nodes.get(id).and_then(|n| n.parent_id.clone());
        for dead in &doomed {
            self.nodes.remove(dead);
        }

        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.nodes.get_mut(&parent_id) {
                if let Some(removed_index) = parent.child_ids.iter().position(|c| c == id) {
                    parent.child_ids.remove(removed_index);
                    parent.active_child_index = match parent.active_child_index {
                        _ if parent.child_ids.is_empty() => None,
                        Some(active) if active == removed_index => {
                            Some(active.min(parent.child_ids.len() - 1))
                        }
                        Some(active) if active > removed_index => Some(active - 1),
                        other => other,
                    };
                }
            }
        }

        self.recompute_tail();
        Ok(())
    }

    /// Make `leaf_id` the tail by activating every branch on its path
    ///
    /// Walks from the leaf to the root, setting each parent's active index to
    /// the child on that path.
    pub fn switch_branch(&mut self, leaf_id: &NodeId) -> Result<(), TreeError> {
        if !self.nodes.contains_key(leaf_id) {
            return Err(TreeError::NotFound(leaf_id.clone()));
        }

        let mut current = leaf_id.clone();
        while let Some(parent_id) = self.nodes.get(&current).and_then(|n| n.parent_id.clone()) {
            let index = self
                .nodes
                .get(&parent_id)
                .and_then(|p| p.child_ids.iter().position(|c| *c == current));
            // Parent/child symmetry guarantees the position exists
            if let (Some(index), Some(parent)) = (index, self.nodes.get_mut(&parent_id)) {
                parent.active_child_index = Some(index);
            }
            current = parent_id;
        }

        self.recompute_tail();
        Ok(())
    }

    /// Re-derive the tail by following active branches from the root
    ///
    /// Runs after every mutation; the stored tail is a cache, never a source
    /// of truth.
    pub fn recompute_tail(&mut self) -> NodeId {
        let mut current = self.root_id.clone();
        while let Some(next) = self
            .nodes
            .get(&current)
            .and_then(ChatNode::active_child)
            .cloned()
        {
            current = next;
        }
        self.tail_id = current.clone();
        current
    }

    /// Rewrite a node id everywhere it appears
    ///
    /// Updates the map key, the node itself, the parent's child entry, the
    /// children's parent references, and the tail pointer in one step, so no
    /// half-rewritten tree is ever observable. Returns false if the old id is
    /// not present (the node may have been deleted while its create was in
    /// flight).
    pub(crate) fn rewrite_id(&mut self, old: &NodeId, new: NodeId) -> bool {
        let Some(mut node) = self.nodes.remove(old) else {
            return false;
        };
        node.id = new.clone();

        if let Some(parent_id) = &node.parent_id {
            if let Some(parent) = self.nodes.get_mut(parent_id) {
                for child in &mut parent.child_ids {
                    if child == old {
                        *child = new.clone();
                    }
                }
            }
        }
        for child_id in node.child_ids.clone() {
            if let Some(child) = self.nodes.get_mut(&child_id) {
                child.parent_id = Some(new.clone());
            }
        }
        if self.tail_id == *old {
            self.tail_id = new.clone();
        }
        if self.root_id == *old {
            self.root_id = new.clone();
        }

        self.nodes.insert(new, node);
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
