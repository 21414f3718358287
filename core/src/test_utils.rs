//! Test Utilities
//!
//! Shared test doubles for exercising the gateway and session layers without
//! a real server. Public (not `cfg(test)`) so downstream crates can drive the
//! same scenarios against their own integrations.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::transport::{ChatTransport, CreateAck, CreateNodeRequest, TransportError};
use crate::tree::{now_ms, NodeId};

/// One recorded server call, in arrival order
#[derive(Clone, Debug, PartialEq)]
pub enum TransportCall {
    /// A create-node request
    Create(CreateNodeRequest),
    /// An edit-node request
    Edit {
        /// Target node
        id: NodeId,
        /// Replacement content
        content: String,
    },
    /// A delete-node request
    Delete {
        /// Target node
        id: NodeId,
    },
    /// A switch-branch request
    Switch {
        /// The leaf made active
        leaf_id: NodeId,
    },
}

/// Scriptable in-process transport
///
/// Assigns sequential `srv-N` ids to creates, records every call, and can be
/// told to fail specific operations or to hold creates open so tests can
/// observe the client mid-flight.
pub struct ScriptedTransport {
    history: Mutex<Vec<TransportCall>>,
    next_id: AtomicU64,
    fail_create: Mutex<Option<String>>,
    fail_edit: Mutex<Option<String>>,
    fail_delete: Mutex<Option<String>>,
    fail_switch: Mutex<Option<String>>,
    gate_tx: watch::Sender<bool>,
    gate_rx: watch::Receiver<bool>,
}

impl ScriptedTransport {
    /// Create a transport that succeeds at everything
    #[must_use]
    pub fn new() -> Self {
        let (gate_tx, gate_rx) = watch::channel(false);
        Self {
            history: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            fail_create: Mutex::new(None),
            fail_edit: Mutex::new(None),
            fail_delete: Mutex::new(None),
            fail_switch: Mutex::new(None),
            gate_tx,
            gate_rx,
        }
    }

    /// Every call received so far, in order
    #[must_use]
    pub fn history(&self) -> Vec<TransportCall> {
        self.history.lock().clone()
    }

    /// Delete calls received so far
    #[must_use]
    pub fn deletes(&self) -> Vec<NodeId> {
        self.history
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Delete { id } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Make all subsequent creates fail with the given reason
    pub fn fail_creates(&self, reason: impl Into<String>) {
        *self.fail_create.lock() = Some(reason.into());
    }

    /// Make all subsequent edits fail with the given reason
    pub fn fail_edits(&self, reason: impl Into<String>) {
        *self.fail_edit.lock() = Some(reason.into());
    }

    /// Make all subsequent deletes fail with the given reason
    pub fn fail_deletes(&self, reason: impl Into<String>) {
        *self.fail_delete.lock() = Some(reason.into());
    }

    /// Make all subsequent branch switches fail with the given reason
    pub fn fail_switches(&self, reason: impl Into<String>) {
        *self.fail_switch.lock() = Some(reason.into());
    }

    /// Clear all scripted failures
    pub fn clear_failures(&self) {
        *self.fail_create.lock() = None;
        *self.fail_edit.lock() = None;
        *self.fail_delete.lock() = None;
        *self.fail_switch.lock() = None;
    }

    /// Hold create calls open until [`Self::release_creates`]
    pub fn hold_creates(&self) {
        let _ = self.gate_tx.send(true);
    }

    /// Let held (and future) create calls proceed
    pub fn release_creates(&self) {
        let _ = self.gate_tx.send(false);
    }

    async fn wait_for_gate(&self) {
        let mut rx = self.gate_rx.clone();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn create_node(&self, request: CreateNodeRequest) -> Result<CreateAck, TransportError> {
        self.history.lock().push(TransportCall::Create(request));
        self.wait_for_gate().await;
        if let Some(reason) = self.fail_create.lock().clone() {
            return Err(TransportError::new(reason));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(CreateAck {
            id: NodeId(format!("srv-{n}")),
            created_at: now_ms(),
        })
    }

    async fn edit_node(&self, id: &NodeId, content: &str) -> Result<(), TransportError> {
        self.history.lock().push(TransportCall::Edit {
            id: id.clone(),
            content: content.to_string(),
        });
        if let Some(reason) = self.fail_edit.lock().clone() {
            return Err(TransportError::new(reason));
        }
        Ok(())
    }

    async fn delete_node(&self, id: &NodeId) -> Result<(), TransportError> {
        self.history.lock().push(TransportCall::Delete { id: id.clone() });
        if let Some(reason) = self.fail_delete.lock().clone() {
            return Err(TransportError::new(reason));
        }
        Ok(())
    }

    async fn switch_branch(&self, leaf_id: &NodeId) -> Result<(), TransportError> {
        self.history.lock().push(TransportCall::Switch {
            leaf_id: leaf_id.clone(),
        });
        if let Some(reason) = self.fail_switch.lock().clone() {
            return Err(TransportError::new(reason));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("calls", &self.history.lock().len())
            .field("holding_creates", &*self.gate_rx.borrow())
            .finish()
    }
}

/// Poll an assertion until it holds or the deadline passes
///
/// Background tasks (create settlement, cancel teardown) finish at their own
/// pace; tests wait for the observable effect instead of sleeping blindly.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while !condition() {
        assert!(
            std::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speaker::SpeakerId;
    use crate::tree::ClientId;
    use std::sync::Arc;

    fn request(content: &str) -> CreateNodeRequest {
        CreateNodeRequest {
            parent_id: NodeId::from("root"),
            content: content.to_string(),
            speaker_id: SpeakerId::new(),
            is_bot: false,
            created_at: now_ms(),
            client_id: ClientId::new(),
        }
    }

    #[tokio::test]
    async fn test_sequential_server_ids() {
        let transport = ScriptedTransport::new();
        let first = transport.create_node(request("a")).await.unwrap();
        let second = transport.create_node(request("b")).await.unwrap();
        assert_eq!(first.id, NodeId::from("srv-0"));
        assert_eq!(second.id, NodeId::from("srv-1"));
        assert_eq!(transport.history().len(), 2);
    }

    #[tokio::test]
    async fn test_gate_holds_then_releases() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.hold_creates();

        let inner = transport.clone();
        let call = tokio::spawn(async move { inner.create_node(request("held")).await });

        // The request is recorded but not yet answered
        wait_until(|| !transport.history().is_empty()).await;
        assert!(!call.is_finished());

        transport.release_creates();
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_scripted_failures_and_clear() {
        let transport = ScriptedTransport::new();
        transport.fail_edits("locked");
        let err = transport
            .edit_node(&NodeId::from("srv-0"), "x")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::new("locked"));

        transport.clear_failures();
        transport.edit_node(&NodeId::from("srv-0"), "x").await.unwrap();
    }
}
