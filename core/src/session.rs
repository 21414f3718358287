//! Streaming Session Controller
//!
//! Orchestrates one assistant response at a time: an empty placeholder node
//! is created optimistically at session start, text fragments accumulate in
//! the [`StreamingBuffer`] while the response streams, and the placeholder is
//! filled in (or discarded) when the session ends.
//!
//! # Lifecycle
//!
//! ```text
//!           start                    finalize / cancel
//!   Idle ──────────▶ Streaming ──────────────────────▶ Idle
//! ```
//!
//! Sessions are versioned by an epoch counter. Any async completion that
//! belongs to an earlier epoch (a create confirmed after cancel, a failure
//! observed after finalize) is recognized as stale and either ignored or
//! routed through cleanup instead of touching the new session's state.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::gateway::{GatewayError, OptimisticMutationGateway, PendingCreate};
use crate::speaker::{SpeakerId, SpeakerRegistry};
use crate::streaming::StreamingBuffer;
use crate::tree::{now_ms, ClientId, NodeId};

/// Session lifecycle errors
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The requested parent node does not exist in the tree
    #[error("streaming parent not found: {0}")]
    NoParent(NodeId),
    /// The requested speaker is not registered
    #[error("unknown speaker: {0}")]
    NoSpeaker(SpeakerId),
    /// Only one streaming session may run at a time
    #[error("a streaming session is already active")]
    AlreadyStreaming,
    /// The operation requires an active session
    #[error("no streaming session is active")]
    NotStreaming,
    /// The underlying mutation failed
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// How a finalize settled
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The accumulated text was written into the node with this id
    Persisted(NodeId),
    /// Nothing was streamed; the placeholder was discarded instead
    DiscardedEmpty,
}

/// Public snapshot of an active session's metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingSession {
    /// Node the response streams under
    pub parent_id: NodeId,
    /// Responding speaker
    pub speaker_id: SpeakerId,
    /// Session start time (Unix timestamp ms)
    pub started_at: u64,
    /// Correlation id of the placeholder node, stable across id rewrites
    pub node_client_id: ClientId,
}

struct ActiveSession {
    session: StreamingSession,
    create: PendingCreate,
}

#[derive(Default)]
struct ControllerState {
    /// Bumped on every start, finalize, cancel, and force-cancel
    epoch: u64,
    active: Option<ActiveSession>,
}

/// Single-session streaming orchestrator
///
/// Cheap to clone; clones share the session state, the buffer, and the
/// gateway.
#[derive(Clone)]
pub struct StreamingSessionController {
    gateway: OptimisticMutationGateway,
    speakers: Arc<SpeakerRegistry>,
    buffer: StreamingBuffer,
    state: Arc<Mutex<ControllerState>>,
}

impl StreamingSessionController {
    /// Create a controller over the given gateway, speakers, and buffer
    #[must_use]
    pub fn new(
        gateway: OptimisticMutationGateway,
        speakers: Arc<SpeakerRegistry>,
        buffer: StreamingBuffer,
    ) -> Self {
        Self {
            gateway,
            speakers,
            buffer,
            state: Arc::new(Mutex::new(ControllerState::default())),
        }
    }

    /// Whether a session is currently streaming
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Metadata of the active session, if any
    #[must_use]
    pub fn session(&self) -> Option<StreamingSession> {
        self.state.lock().active.as_ref().map(|a| a.session.clone())
    }

    /// The shared ingestion buffer (subscribe here for UI updates)
    #[must_use]
    pub fn buffer(&self) -> &StreamingBuffer {
        &self.buffer
    }

    /// The underlying gateway
    #[must_use]
    pub fn gateway(&self) -> &OptimisticMutationGateway {
        &self.gateway
    }

    /// Begin a streaming session under `parent_id`
    ///
    /// Creates an empty placeholder node optimistically; it is visible in the
    /// tree (and is the new tail) before this function returns. If the
    /// placeholder's create later fails server-side, the session
    /// force-cancels itself.
    pub fn start(&self, parent_id: &NodeId, speaker_id: SpeakerId) -> Result<(), SessionError> {
        if !self.gateway.with_tree(|tree| tree.contains(parent_id)) {
            return Err(SessionError::NoParent(parent_id.clone()));
        }
        let speaker = self
            .speakers
            .get(speaker_id)
            .ok_or(SessionError::NoSpeaker(speaker_id))?;

        let mut state = self.state.lock();
        if state.active.is_some() {
            return Err(SessionError::AlreadyStreaming);
        }

        self.buffer.reset();
        let client_id = ClientId::new();
        let create =
            self.gateway
                .add_message(parent_id, "", speaker_id, !speaker.is_user, Some(client_id))?;

        state.epoch += 1;
        let epoch = state.epoch;
        state.active = Some(ActiveSession {
            session: StreamingSession {
                parent_id: parent_id.clone(),
                speaker_id,
                started_at: now_ms(),
                node_client_id: client_id,
            },
            create: create.clone(),
        });
        drop(state);

        tracing::debug!(parent = %parent_id, speaker = %speaker_id, "streaming session started");

        // Watch for the placeholder create failing behind our back
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(err) = create.resolved().await {
                controller.force_cancel(epoch, &err);
            }
        });
        Ok(())
    }

    /// Feed a streamed text fragment into the session
    ///
    /// Ignored (with a trace) when no session is active, so a straggling
    /// producer cannot corrupt state after cancel.
    pub fn append(&self, chunk: impl Into<String>) {
        if self.state.lock().active.is_some() {
            self.buffer.append(chunk);
        } else {
            tracing::trace!("dropped streamed fragment; no active session");
        }
    }

    /// End the session and persist the accumulated text
    ///
    /// Waits for the placeholder's create to settle, then edits the confirmed
    /// node with the full buffer contents. A session that streamed nothing
    /// (or only whitespace) degrades to cancellation and reports
    /// [`FinalizeOutcome::DiscardedEmpty`]. The session is cleared before any
    /// awaiting, so failures leave the controller idle rather than wedged.
    pub async fn finalize(&self) -> Result<FinalizeOutcome, SessionError> {
        let active = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.active.take()
        };
        let Some(active) = active else {
            return Err(SessionError::NotStreaming);
        };

        let content = self.buffer.read();
        self.buffer.reset();

        if content.trim().is_empty() {
            tracing::debug!("finalized with no streamed text; discarding placeholder");
            self.discard(&active).await;
            return Ok(FinalizeOutcome::DiscardedEmpty);
        }

        let ack = active.create.resolved().await?;
        self.gateway.edit_message(&ack.id, &content).await?;
        tracing::debug!(node = %ack.id, chars = content.len(), "streaming session finalized");
        Ok(FinalizeOutcome::Persisted(ack.id))
    }

    /// Abort the session and discard the placeholder
    ///
    /// Local state clears synchronously: the session ends, the buffer empties,
    /// and the placeholder leaves the tree before this returns. The
    /// server-side teardown (waiting out an in-flight create and deleting the
    /// node it confirmed) continues in the background.
    pub fn cancel(&self) {
        let active = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.active.take()
        };
        let Some(active) = active else {
            tracing::trace!("cancel ignored; no active session");
            return;
        };

        self.buffer.reset();
        if let Some(id) = self
            .gateway
            .retract_placeholder(active.session.node_client_id)
        {
            tracing::debug!(node = %id, "streaming session cancelled");
        }

        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            if let Ok(ack) = active.create.resolved().await {
                if let Err(err) = gateway.undo_create(&ack.id).await {
                    tracing::warn!(node = %ack.id, error = %err, "failed to undo cancelled create");
                }
            }
        });
    }

    /// Retract the placeholder and undo its create once settled
    async fn discard(&self, active: &ActiveSession) {
        self.gateway
            .retract_placeholder(active.session.node_client_id);
        if let Ok(ack) = active.create.resolved().await {
            if let Err(err) = self.gateway.undo_create(&ack.id).await {
                tracing::warn!(node = %ack.id, error = %err, "failed to undo discarded create");
            }
        }
    }

    /// Clear the session after its placeholder create failed
    ///
    /// The gateway already rolled the tree back; only session state and the
    /// buffer need clearing. A stale epoch means a newer session replaced
    /// this one and the failure no longer applies.
    fn force_cancel(&self, epoch: u64, err: &GatewayError) {
        {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.active.is_none() {
                return;
            }
            state.epoch += 1;
            state.active = None;
        }
        self.buffer.reset();
        tracing::warn!(error = %err, "placeholder creation failed; session force-cancelled");
    }
}

impl std::fmt::Debug for StreamingSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSessionController")
            .field("streaming", &self.is_streaming())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speaker::Speaker;
    use crate::streaming::ManualScheduler;
    use crate::test_utils::{wait_until, ScriptedTransport, TransportCall};
    use crate::transport::TransportError;
    use crate::tree::{ChatNode, ChatTree};
    use pretty_assertions::assert_eq;

    struct Fixture {
        controller: StreamingSessionController,
        transport: Arc<ScriptedTransport>,
        scheduler: Arc<ManualScheduler>,
        root_id: NodeId,
        bot: SpeakerId,
    }

    fn fixture() -> Fixture {
        let user = Speaker::new("alice", true);
        let bot_speaker = Speaker::new("assistant", false);
        let bot = bot_speaker.id;
        let speakers = Arc::new(SpeakerRegistry::new());
        speakers.insert(user.clone());
        speakers.insert(bot_speaker);

        let root = ChatNode::root(NodeId::from("root"), user.id, "");
        let root_id = root.id.clone();
        let transport = Arc::new(ScriptedTransport::new());
        let gateway = OptimisticMutationGateway::new(ChatTree::new(root), transport.clone());

        let scheduler = Arc::new(ManualScheduler::new());
        let buffer = StreamingBuffer::new(scheduler.clone());
        Fixture {
            controller: StreamingSessionController::new(gateway, speakers, buffer),
            transport,
            scheduler,
            root_id,
            bot,
        }
    }

    #[tokio::test]
    async fn test_start_requires_known_parent_and_speaker() {
        let f = fixture();
        assert_eq!(
            f.controller.start(&NodeId::from("ghost"), f.bot),
            Err(SessionError::NoParent(NodeId::from("ghost")))
        );
        let stranger = SpeakerId::new();
        assert_eq!(
            f.controller.start(&f.root_id, stranger),
            Err(SessionError::NoSpeaker(stranger))
        );
        assert!(!f.controller.is_streaming());
    }

    #[tokio::test]
    async fn test_only_one_session_at_a_time() {
        let f = fixture();
        f.controller.start(&f.root_id, f.bot).unwrap();
        assert_eq!(
            f.controller.start(&f.root_id, f.bot),
            Err(SessionError::AlreadyStreaming)
        );
    }

    #[tokio::test]
    async fn test_placeholder_is_tail_immediately() {
        let f = fixture();
        f.transport.hold_creates();
        f.controller.start(&f.root_id, f.bot).unwrap();

        let session = f.controller.session().unwrap();
        let node = f
            .controller
            .gateway()
            .find_by_client_id(session.node_client_id)
            .unwrap();
        assert_eq!(node.message, "");
        assert!(node.is_bot);
        assert_eq!(f.controller.gateway().tail_id(), node.id);
        f.transport.release_creates();
    }

    #[tokio::test]
    async fn test_full_streaming_flow() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.controller
            .buffer()
            .subscribe(move |content| sink.lock().push(content.to_string()));

        f.controller.start(&f.root_id, f.bot).unwrap();
        f.controller.append("Hel");
        f.controller.append("lo ");
        f.scheduler.fire();
        f.controller.append("world");
        f.scheduler.fire();

        assert_eq!(
            *seen.lock(),
            vec!["Hello ".to_string(), "Hello world".to_string()]
        );

        let outcome = f.controller.finalize().await.unwrap();
        let FinalizeOutcome::Persisted(id) = outcome else {
            panic!("expected persisted outcome, got {outcome:?}");
        };
        assert!(!f.controller.is_streaming());
        f.controller
            .gateway()
            .with_tree(|tree| assert_eq!(tree.get(&id).unwrap().message, "Hello world"));

        // One create (placeholder) then one edit (final content)
        let history = f.transport.history();
        assert!(matches!(history[0], TransportCall::Create(_)));
        assert_eq!(
            history[1],
            TransportCall::Edit {
                id,
                content: "Hello world".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_finalize_reads_unflushed_fragments() {
        let f = fixture();
        f.controller.start(&f.root_id, f.bot).unwrap();
        f.controller.append("tail fragment");
        // No scheduler fire: the flush tick never ran

        let outcome = f.controller.finalize().await.unwrap();
        let FinalizeOutcome::Persisted(id) = outcome else {
            panic!("expected persisted outcome");
        };
        f.controller
            .gateway()
            .with_tree(|tree| assert_eq!(tree.get(&id).unwrap().message, "tail fragment"));
    }

    #[tokio::test]
    async fn test_empty_finalize_discards_placeholder() {
        let f = fixture();
        f.controller.start(&f.root_id, f.bot).unwrap();

        let outcome = f.controller.finalize().await.unwrap();
        assert_eq!(outcome, FinalizeOutcome::DiscardedEmpty);
        assert!(!f.controller.is_streaming());
        f.controller.gateway().with_tree(|tree| {
            assert_eq!(tree.len(), 1);
            assert_eq!(tree.tail_id(), &f.root_id);
        });
        // The confirmed create was undone server-side
        assert_eq!(f.transport.deletes(), vec![NodeId::from("srv-0")]);
    }

    #[tokio::test]
    async fn test_whitespace_only_finalize_discards() {
        let f = fixture();
        f.controller.start(&f.root_id, f.bot).unwrap();
        f.controller.append("  \n\t ");

        let outcome = f.controller.finalize().await.unwrap();
        assert_eq!(outcome, FinalizeOutcome::DiscardedEmpty);
    }

    #[tokio::test]
    async fn test_finalize_without_session() {
        let f = fixture();
        assert_eq!(
            f.controller.finalize().await,
            Err(SessionError::NotStreaming)
        );
    }

    #[tokio::test]
    async fn test_append_while_idle_is_dropped() {
        let f = fixture();
        f.controller.append("stray");
        assert_eq!(f.controller.buffer().read(), "");
    }

    #[tokio::test]
    async fn test_cancel_clears_locally_before_create_settles() {
        let f = fixture();
        f.transport.hold_creates();
        f.controller.start(&f.root_id, f.bot).unwrap();
        f.controller.append("partial resp");

        f.controller.cancel();

        // Everything local is gone synchronously
        assert!(!f.controller.is_streaming());
        assert_eq!(f.controller.buffer().read(), "");
        f.controller.gateway().with_tree(|tree| {
            assert_eq!(tree.len(), 1);
            assert_eq!(tree.tail_id(), &f.root_id);
        });

        // Once the create confirms, the stale node is deleted server-side
        f.transport.release_creates();
        let transport = f.transport.clone();
        wait_until(move || !transport.deletes().is_empty()).await;
        assert_eq!(f.transport.deletes(), vec![NodeId::from("srv-0")]);
        f.controller
            .gateway()
            .with_tree(|tree| assert_eq!(tree.len(), 1));
    }

    #[tokio::test]
    async fn test_cancel_after_confirmed_create() {
        let f = fixture();
        f.controller.start(&f.root_id, f.bot).unwrap();
        let session = f.controller.session().unwrap();
        let create = {
            // Wait for the id rewrite so cancel targets a confirmed node
            let gateway = f.controller.gateway().clone();
            wait_until(move || gateway.pending_creates() == 0).await;
            f.controller
                .gateway()
                .find_by_client_id(session.node_client_id)
                .unwrap()
        };
        assert!(!create.id.is_temporary());

        f.controller.cancel();

        let transport = f.transport.clone();
        wait_until(move || !transport.deletes().is_empty()).await;
        assert_eq!(f.transport.deletes(), vec![create.id]);
        f.controller
            .gateway()
            .with_tree(|tree| assert_eq!(tree.len(), 1));
    }

    #[tokio::test]
    async fn test_cancel_without_session_is_noop() {
        let f = fixture();
        f.controller.cancel();
        assert!(!f.controller.is_streaming());
    }

    #[tokio::test]
    async fn test_failed_create_force_cancels_session() {
        let f = fixture();
        f.transport.fail_creates("backend down");
        f.controller.start(&f.root_id, f.bot).unwrap();

        // Optimistic placeholder was visible, then the failure unwinds it
        let controller = f.controller.clone();
        wait_until(move || !controller.is_streaming()).await;
        f.controller.gateway().with_tree(|tree| {
            assert_eq!(tree.len(), 1);
            assert_eq!(tree.tail_id(), &f.root_id);
        });
    }

    #[tokio::test]
    async fn test_finalize_surfaces_create_failure() {
        let f = fixture();
        f.transport.hold_creates();
        f.transport.fail_creates("backend down");
        f.controller.start(&f.root_id, f.bot).unwrap();
        f.controller.append("doomed");

        let controller = f.controller.clone();
        let finalize = tokio::spawn(async move { controller.finalize().await });
        f.transport.release_creates();

        let err = finalize.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            SessionError::Gateway(GatewayError::Network(TransportError::new("backend down")))
        );
        assert!(!f.controller.is_streaming());
        f.controller
            .gateway()
            .with_tree(|tree| assert_eq!(tree.len(), 1));
    }

    #[tokio::test]
    async fn test_restart_after_cancel() {
        let f = fixture();
        f.controller.start(&f.root_id, f.bot).unwrap();
        f.controller.append("first try");
        f.controller.cancel();

        f.controller.start(&f.root_id, f.bot).unwrap();
        f.controller.append("second try");
        let outcome = f.controller.finalize().await.unwrap();
        let FinalizeOutcome::Persisted(id) = outcome else {
            panic!("expected persisted outcome");
        };
        f.controller
            .gateway()
            .with_tree(|tree| assert_eq!(tree.get(&id).unwrap().message, "second try"));
    }
}
