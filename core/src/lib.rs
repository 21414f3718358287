//! Arbor Core - Client-Side Mirror of a Branching Conversation Tree
//!
//! This crate keeps a local, instantly-responsive copy of a conversation tree
//! whose authoritative state lives on a server. Messages form a tree rather
//! than a list: editing a message forks a sibling branch, and exactly one
//! root-to-leaf path (the active path) is rendered at a time. It is
//! completely independent of any UI framework and can drive a TUI, web UI,
//! native GUI, or run headless for testing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         UI Surface                           │
//! │        reads tree snapshots, subscribes to the buffer        │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 │                              │
//! ┌───────────────┴──────────────┐ ┌─────────────┴───────────────┐
//! │ StreamingSessionController   │ │      StreamingBuffer        │
//! │  start / append / finalize   │ │  frame-coalesced fragments  │
//! │          / cancel            │ │   one notification / tick   │
//! └───────────────┬──────────────┘ └─────────────────────────────┘
//!                 │
//! ┌───────────────┴──────────────────────────────────────────────┐
//! │              OptimisticMutationGateway                       │
//! │   snapshot → optimistic apply → dispatch → reconcile/rollback│
//! │   single writer of the ChatTree, tracks in-flight creates    │
//! └───────────────┬──────────────────────────┬───────────────────┘
//!                 │                          │
//!         ┌───────┴────────┐        ┌────────┴────────┐
//!         │    ChatTree    │        │  ChatTransport  │
//!         │  pure algebra  │        │  (server, mock) │
//!         └────────────────┘        └─────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ChatTree`]: The branching message tree and its four local operations
//! - [`OptimisticMutationGateway`]: Optimistic apply with rollback and
//!   temp-id reconciliation
//! - [`StreamingBuffer`]: Coalesces streamed fragments into per-frame
//!   notifications
//! - [`StreamingSessionController`]: One-at-a-time assistant response
//!   lifecycle
//! - [`ChatTransport`]: The abstract server boundary
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use arbor_core::{
//!     ChatNode, ChatTree, NodeId, OptimisticMutationGateway, Speaker,
//!     SpeakerRegistry, StreamingBuffer, StreamingSessionController,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let speakers = Arc::new(SpeakerRegistry::new());
//!     let user = Speaker::new("you", true);
//!     let assistant = Speaker::new("assistant", false);
//!     let (user_id, bot_id) = (speakers.insert(user), speakers.insert(assistant));
//!
//!     let tree = ChatTree::new(ChatNode::root(NodeId::from("root"), user_id, ""));
//!     let gateway = OptimisticMutationGateway::new(tree, Arc::new(MyTransport));
//!     let controller = StreamingSessionController::new(
//!         gateway.clone(),
//!         speakers,
//!         StreamingBuffer::with_frame_fallback(),
//!     );
//!
//!     // User turn: optimistic, instantly visible
//!     let msg = gateway
//!         .add_message(&gateway.tail_id(), "hello", user_id, false, None)
//!         .unwrap();
//!
//!     // Assistant turn: placeholder now, content streams in
//!     controller.start(&msg.resolved().await.unwrap().id, bot_id).unwrap();
//!     controller.append("Hi ");
//!     controller.append("there!");
//!     controller.finalize().await.unwrap();
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`tree`]: The conversation tree aggregate and its pure local algebra
//! - [`gateway`]: Optimistic mutations with server reconciliation
//! - [`streaming`]: Fragment coalescing and flush-tick scheduling
//! - [`session`]: Streaming response lifecycle orchestration
//! - [`speaker`]: Speaker records and the shared registry
//! - [`transport`]: The abstract network boundary
//! - [`test_utils`]: Scriptable in-process transport for tests
//!
//! # No UI Dependencies
//!
//! This crate has **zero** dependencies on any UI framework. It's pure
//! client-state logic that can be embedded anywhere.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod gateway;
pub mod session;
pub mod speaker;
pub mod streaming;
pub mod test_utils;
pub mod transport;
pub mod tree;

// Re-exports for convenience
pub use gateway::{GatewayError, OptimisticMutationGateway, PendingCreate};
pub use session::{FinalizeOutcome, SessionError, StreamingSession, StreamingSessionController};
pub use speaker::{Speaker, SpeakerId, SpeakerRegistry};
pub use streaming::{
    ManualScheduler, StreamingBuffer, SubscriberId, TickScheduler, TimerScheduler,
    FRAME_FALLBACK_PERIOD,
};
pub use transport::{ChatTransport, CreateAck, CreateNodeRequest, TransportError};
pub use tree::{ChatNode, ChatTree, ClientId, NodeId, TreeError, TEMP_ID_PREFIX};
