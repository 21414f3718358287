//! Chat Transport Traits
//!
//! The abstract network boundary between the client-side mirror and the
//! server that owns the conversation. The exact wire protocol is out of
//! scope; implementations handle transport-specific details (HTTP, sockets,
//! in-process test doubles) behind this trait.
//!
//! # Design Philosophy
//!
//! The gateway never talks to a concrete server. It issues one of four
//! request types and reconciles the tree with the outcome. Everything here
//! is idempotent-safe from the caller's perspective except `create_node`,
//! which the session layer guards against duplicate submission by tracking
//! the in-flight request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::speaker::SpeakerId;
use crate::tree::{ClientId, NodeId};

/// Transport or server rejection
///
/// Always triggers rollback of the specific optimistic mutation; never
/// retried automatically.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("network failure: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    /// Create a transport error from any message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Request to create a node on the server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateNodeRequest {
    /// Parent the new node hangs under
    pub parent_id: NodeId,
    /// Initial message content (empty for streaming placeholders)
    pub content: String,
    /// Authoring speaker
    pub speaker_id: SpeakerId,
    /// Whether the message is bot-authored
    pub is_bot: bool,
    /// Client-side creation time (Unix timestamp ms)
    pub created_at: u64,
    /// Correlation id; the server is asked to preserve the client's chosen
    /// identity when it can
    pub client_id: ClientId,
}

/// Server acknowledgment of a create
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateAck {
    /// Authoritative node id (may differ from the client's temporary id)
    pub id: NodeId,
    /// Authoritative creation time (Unix timestamp ms)
    pub created_at: u64,
}

/// The four server request types
///
/// Implement this trait to connect the gateway to a real server. All calls
/// settle exactly once; the gateway applies mutations optimistically before
/// dispatching and rolls back when a call fails.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Create a node under a parent; returns the confirmed identity
    async fn create_node(&self, request: CreateNodeRequest) -> Result<CreateAck, TransportError>;

    /// Replace a node's content
    async fn edit_node(&self, id: &NodeId, content: &str) -> Result<(), TransportError>;

    /// Delete a node and its subtree
    async fn delete_node(&self, id: &NodeId) -> Result<(), TransportError>;

    /// Make the given leaf the active branch
    async fn switch_branch(&self, leaf_id: &NodeId) -> Result<(), TransportError>;
}
