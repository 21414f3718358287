//! Optimistic Mutation Gateway
//!
//! Makes every tree mutation feel instantaneous while staying consistent
//! with a server that may reorder, reject, or reassign identities. Every
//! operation follows the same protocol:
//!
//! ```text
//! snapshot → optimistic local apply → dispatch → (reconcile | rollback)
//! ```
//!
//! The local apply completes before the first await point, so callers always
//! observe the optimistic state immediately. Snapshots are whole-tree copies
//! taken just before the apply and discarded once the dispatch settles;
//! rollback replaces the entire tree with the snapshot, never a partial
//! revert.
//!
//! # Single writer
//!
//! The gateway owns the [`ChatTree`]. External consumers read through
//! [`OptimisticMutationGateway::with_tree`] and mutate only through the four
//! operations here (or the session controller built on top of them).

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::speaker::SpeakerId;
use crate::transport::{ChatTransport, CreateAck, CreateNodeRequest, TransportError};
use crate::tree::{ChatNode, ChatTree, ClientId, NodeId, TreeError};

/// Errors surfaced by gateway operations
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Local tree-algebra failure; nothing was dispatched
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// Transport/server rejection; the optimistic mutation was rolled back
    #[error(transparent)]
    Network(#[from] TransportError),
}

/// Shared view of an in-flight create's eventual outcome
type SharedAck = Shared<BoxFuture<'static, Result<CreateAck, GatewayError>>>;

/// Handle to an optimistically-created node whose server identity is still
/// settling
///
/// The node is already live and renderable under a temporary id. Cloning the
/// handle is cheap; every clone resolves to the same settled outcome, which
/// lets the finalize path, the cancel cleanup, and the failure watcher all
/// await one create without duplicating the request.
#[derive(Clone)]
pub struct PendingCreate {
    temp_id: NodeId,
    client_id: ClientId,
    ack: SharedAck,
}

impl PendingCreate {
    /// The temporary id the node holds until the server confirms
    #[must_use]
    pub fn temp_id(&self) -> &NodeId {
        &self.temp_id
    }

    /// The stable correlation id
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Wait for the create to settle
    ///
    /// Resolves to the confirmed identity, or the error that caused the
    /// optimistic node to be rolled back.
    pub async fn resolved(&self) -> Result<CreateAck, GatewayError> {
        self.ack.clone().await
    }
}

impl std::fmt::Debug for PendingCreate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCreate")
            .field("temp_id", &self.temp_id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Optimistic, reconciling front door for all tree mutations
///
/// Cheap to clone; clones share the tree, the transport, and the in-flight
/// create bookkeeping.
#[derive(Clone)]
pub struct OptimisticMutationGateway {
    tree: Arc<Mutex<ChatTree>>,
    transport: Arc<dyn ChatTransport>,
    pending: Arc<Mutex<HashMap<NodeId, PendingCreate>>>,
}

impl OptimisticMutationGateway {
    /// Create a gateway owning the given tree
    #[must_use]
    pub fn new(tree: ChatTree, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            tree: Arc::new(Mutex::new(tree)),
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read the tree under the lock
    pub fn with_tree<R>(&self, f: impl FnOnce(&ChatTree) -> R) -> R {
        f(&self.tree.lock())
    }

    /// Current tail id
    #[must_use]
    pub fn tail_id(&self) -> NodeId {
        self.tree.lock().tail_id().clone()
    }

    /// Current active path, root to tail
    #[must_use]
    pub fn active_path(&self) -> Vec<NodeId> {
        self.tree.lock().active_path()
    }

    /// Look up a node by its stable correlation id
    #[must_use]
    pub fn find_by_client_id(&self, client_id: ClientId) -> Option<ChatNode> {
        self.tree.lock().find_by_client_id(client_id).cloned()
    }

    /// Number of creates still awaiting server confirmation
    #[must_use]
    pub fn pending_creates(&self) -> usize {
        self.pending.lock().len()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Add a message under `parent_id`, optimistically and immediately
    ///
    /// The node is inserted under a temporary id before this function
    /// returns; the server request settles in the background. On success the
    /// temporary id is rewritten to the server's id everywhere it appears,
    /// preserving `client_id`. On failure the pre-mutation snapshot is
    /// restored and the returned handle resolves to the error.
    pub fn add_message(
        &self,
        parent_id: &NodeId,
        content: impl Into<String>,
        speaker_id: SpeakerId,
        is_bot: bool,
        client_id: Option<ClientId>,
    ) -> Result<PendingCreate, GatewayError> {
        let client_id = client_id.unwrap_or_default();
        let temp_id = NodeId::temporary();
        let content = content.into();

        let (snapshot, created_at) = {
            let mut tree = self.tree.lock();
            let snapshot = tree.clone();
            let node = ChatNode::new(
                temp_id.clone(),
                client_id,
                Some(parent_id.clone()),
                speaker_id,
                content.clone(),
                is_bot,
            );
            let created_at = node.created_at;
            tree.add_node(parent_id, node)?;
            (snapshot, created_at)
        };

        let request = CreateNodeRequest {
            parent_id: parent_id.clone(),
            content,
            speaker_id,
            is_bot,
            created_at,
            client_id,
        };

        let (tx, rx) = oneshot::channel();
        let ack: SharedAck = async move {
            rx.await.unwrap_or_else(|_| {
                Err(GatewayError::Network(TransportError::new(
                    "create task dropped before settling",
                )))
            })
        }
        .boxed()
        .shared();

        let handle = PendingCreate {
            temp_id: temp_id.clone(),
            client_id,
            ack,
        };
        self.pending.lock().insert(temp_id.clone(), handle.clone());

        let gateway = self.clone();
        tokio::spawn(async move {
            let result = gateway.settle_create(request, temp_id, snapshot).await;
            let _ = tx.send(result);
        });

        Ok(handle)
    }

    /// Replace a node's content
    ///
    /// A temporary id is resolved through its in-flight create first, so an
    /// edit can never target a server id that does not exist yet.
    pub async fn edit_message(&self, node_id: &NodeId, content: &str) -> Result<(), GatewayError> {
        let node_id = self.resolve(node_id).await?;

        let snapshot = {
            let mut tree = self.tree.lock();
            let snapshot = tree.clone();
            tree.edit_content(&node_id, content)?;
            snapshot
        };

        if let Err(err) = self.transport.edit_node(&node_id, content).await {
            *self.tree.lock() = snapshot;
            tracing::warn!(node = %node_id, error = %err, "edit rejected; restored snapshot");
            return Err(GatewayError::Network(err));
        }
        Ok(())
    }

    /// Delete a node and its subtree
    ///
    /// A node the server never confirmed settles as a local no-op success —
    /// there is nothing remote to delete. Must not target an ancestor of an
    /// active streaming placeholder; that interleaving is unsupported.
    pub async fn delete_message(&self, node_id: &NodeId) -> Result<(), GatewayError> {
        let node_id = self.resolve(node_id).await?;

        let snapshot = {
            let mut tree = self.tree.lock();
            let snapshot = tree.clone();
            tree.delete_subtree(&node_id)?;
            snapshot
        };

        if node_id.is_temporary() {
            tracing::debug!(node = %node_id, "deleted unconfirmed node locally only");
            return Ok(());
        }

        if let Err(err) = self.transport.delete_node(&node_id).await {
            *self.tree.lock() = snapshot;
            tracing::warn!(node = %node_id, error = %err, "delete rejected; restored snapshot");
            return Err(GatewayError::Network(err));
        }
        Ok(())
    }

    /// Make `leaf_id` the active branch
    pub async fn switch_branch(&self, leaf_id: &NodeId) -> Result<(), GatewayError> {
        let leaf_id = self.resolve(leaf_id).await?;

        let snapshot = {
            let mut tree = self.tree.lock();
            let snapshot = tree.clone();
            tree.switch_branch(&leaf_id)?;
            snapshot
        };

        if let Err(err) = self.transport.switch_branch(&leaf_id).await {
            *self.tree.lock() = snapshot;
            tracing::warn!(leaf = %leaf_id, error = %err, "branch switch rejected; restored snapshot");
            return Err(GatewayError::Network(err));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session-coordination hooks
    // ------------------------------------------------------------------

    /// Remove a streaming placeholder locally, by correlation id
    ///
    /// Local-only and synchronous: the cancel path uses this so the UI never
    /// shows a cancelled node, while the network-side teardown happens later
    /// through [`Self::undo_create`]. Returns the removed node's current id.
    pub fn retract_placeholder(&self, client_id: ClientId) -> Option<NodeId> {
        let mut tree = self.tree.lock();
        let id = tree.find_by_client_id(client_id).map(|n| n.id.clone())?;
        match tree.delete_subtree(&id) {
            Ok(()) => Some(id),
            Err(err) => {
                tracing::warn!(node = %id, error = %err, "failed to retract placeholder");
                None
            }
        }
    }

    /// Tear down a create that was confirmed after the user cancelled
    ///
    /// Removes any local remnant, then deletes the node server-side. Unlike
    /// [`Self::delete_message`] this tolerates the node being locally absent
    /// already (the cancel path retracts it eagerly).
    pub async fn undo_create(&self, id: &NodeId) -> Result<(), GatewayError> {
        {
            let mut tree = self.tree.lock();
            if tree.contains(id) {
                tree.delete_subtree(id)?;
            }
        }
        if id.is_temporary() {
            return Ok(());
        }
        self.transport
            .delete_node(id)
            .await
            .map_err(GatewayError::Network)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Await the in-flight create behind a temporary id, if any
    async fn resolve(&self, id: &NodeId) -> Result<NodeId, GatewayError> {
        if !id.is_temporary() {
            return Ok(id.clone());
        }
        let pending = self.pending.lock().get(id).cloned();
        match pending {
            Some(create) => Ok(create.resolved().await?.id),
            None => Ok(id.clone()),
        }
    }

    /// Background half of `add_message`: dispatch, then reconcile or roll back
    async fn settle_create(
        &self,
        request: CreateNodeRequest,
        temp_id: NodeId,
        snapshot: ChatTree,
    ) -> Result<CreateAck, GatewayError> {
        let result = match self.transport.create_node(request).await {
            Ok(ack) => {
                let mut tree = self.tree.lock();
                if ack.id != temp_id {
                    tree.rewrite_id(&temp_id, ack.id.clone());
                }
                if let Some(node) = tree.get_mut(&ack.id) {
                    node.created_at = ack.created_at;
                }
                tracing::debug!(temp = %temp_id, node = %ack.id, "create confirmed");
                Ok(ack)
            }
            Err(err) => {
                *self.tree.lock() = snapshot;
                tracing::warn!(temp = %temp_id, error = %err, "create rejected; restored snapshot");
                Err(GatewayError::Network(err))
            }
        };
        self.pending.lock().remove(&temp_id);
        result
    }
}

impl std::fmt::Debug for OptimisticMutationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticMutationGateway")
            .field("nodes", &self.tree.lock().len())
            .field("pending_creates", &self.pending_creates())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
