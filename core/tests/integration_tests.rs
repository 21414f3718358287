//! Integration tests for the conversation mirror
//!
//! These tests verify that multiple components work together correctly in
//! realistic usage scenarios. Tests cover:
//! - A full user-turn / assistant-turn conversation with streaming
//! - Edit-driven branch forking and branch switching
//! - Optimistic rollback visible through the public API
//! - The cancel-after-create race
//! - Rehydrating a tree from a server payload and resuming work

use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use arbor_core::test_utils::{wait_until, ScriptedTransport, TransportCall};
use arbor_core::{
    ChatNode, ChatTree, FinalizeOutcome, ManualScheduler, NodeId, OptimisticMutationGateway,
    Speaker, SpeakerId, SpeakerRegistry, StreamingBuffer, StreamingSessionController,
};

// =============================================================================
// Shared fixture
// =============================================================================

struct Chat {
    controller: StreamingSessionController,
    gateway: OptimisticMutationGateway,
    transport: Arc<ScriptedTransport>,
    scheduler: Arc<ManualScheduler>,
    root_id: NodeId,
    user: SpeakerId,
    bot: SpeakerId,
}

fn chat() -> Chat {
    let speakers = Arc::new(SpeakerRegistry::new());
    let user = speakers.insert(Speaker::new("you", true));
    let bot = speakers.insert(Speaker::new("assistant", false));

    let root = ChatNode::root(NodeId::from("root"), user, "");
    let root_id = root.id.clone();
    let transport = Arc::new(ScriptedTransport::new());
    let gateway = OptimisticMutationGateway::new(ChatTree::new(root), transport.clone());

    let scheduler = Arc::new(ManualScheduler::new());
    let buffer = StreamingBuffer::new(scheduler.clone());
    let controller = StreamingSessionController::new(gateway.clone(), speakers, buffer);
    Chat {
        controller,
        gateway,
        transport,
        scheduler,
        root_id,
        user,
        bot,
    }
}

/// Send a user message and wait for its server confirmation
async fn user_turn(chat: &Chat, parent: &NodeId, text: &str) -> NodeId {
    let pending = chat
        .gateway
        .add_message(parent, text, chat.user, false, None)
        .unwrap();
    pending.resolved().await.unwrap().id
}

/// Stream a full assistant response under `parent` and return the node id
async fn assistant_turn(chat: &Chat, parent: &NodeId, text: &str) -> NodeId {
    chat.controller.start(parent, chat.bot).unwrap();
    for chunk in text.split_inclusive(' ') {
        chat.controller.append(chunk);
    }
    chat.scheduler.fire();
    match chat.controller.finalize().await.unwrap() {
        FinalizeOutcome::Persisted(id) => id,
        FinalizeOutcome::DiscardedEmpty => panic!("assistant turn streamed no text"),
    }
}

// =============================================================================
// Test 1: full conversation with streaming
// =============================================================================

#[tokio::test]
async fn test_conversation_round_trip() {
    let chat = chat();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    chat.controller
        .buffer()
        .subscribe(move |content| sink.lock().push(content.to_string()));

    let q = user_turn(&chat, &chat.root_id, "what is a closure?").await;
    let a = assistant_turn(&chat, &q, "A function that captures its environment.").await;

    // Linear active path: root → question → answer, answer is the tail
    assert_eq!(
        chat.gateway.active_path(),
        vec![chat.root_id.clone(), q.clone(), a.clone()]
    );
    assert_eq!(chat.gateway.tail_id(), a);

    // Subscribers saw the coalesced buffer, one notification per fired tick
    assert_eq!(
        *seen.lock(),
        vec!["A function that captures its environment.".to_string()]
    );

    // Every id in the tree is server-assigned by now
    chat.gateway.with_tree(|tree| {
        for id in tree.active_path() {
            assert!(!id.is_temporary(), "unexpected temporary id {id} after settle");
        }
    });
}

// =============================================================================
// Test 2: edit forks a sibling branch, switch restores the old one
// =============================================================================

#[tokio::test]
async fn test_regenerate_via_branching() {
    let chat = chat();
    let q = user_turn(&chat, &chat.root_id, "tell me a joke").await;
    let first = assistant_turn(&chat, &q, "Knock knock.").await;

    // Regenerate: a second answer under the same question
    let second = assistant_turn(&chat, &q, "A horse walks into a bar.").await;

    chat.gateway.with_tree(|tree| {
        let question = tree.get(&q).unwrap();
        assert_eq!(question.child_ids, vec![first.clone(), second.clone()]);
        // The newest sibling is active
        assert_eq!(question.active_child(), Some(&second));
    });
    assert_eq!(chat.gateway.tail_id(), second);

    // Switching back to the first answer re-derives the tail
    chat.gateway.switch_branch(&first).await.unwrap();
    assert_eq!(chat.gateway.tail_id(), first);
    assert!(chat
        .transport
        .history()
        .contains(&TransportCall::Switch {
            leaf_id: first.clone()
        }));

    // The inactive branch is still intact, just not rendered
    chat.gateway
        .with_tree(|tree| assert_eq!(tree.get(&second).unwrap().message, "A horse walks into a bar."));
}

// =============================================================================
// Test 3: rejected mutations leave no trace
// =============================================================================

#[tokio::test]
async fn test_rejected_edit_rolls_back_cleanly() {
    let chat = chat();
    let q = user_turn(&chat, &chat.root_id, "original").await;
    let before = chat.gateway.with_tree(Clone::clone);

    chat.transport.fail_edits("server rejected");
    chat.gateway.edit_message(&q, "tampered").await.unwrap_err();

    // Bit-for-bit identical to the pre-edit tree
    assert_eq!(chat.gateway.with_tree(Clone::clone), before);

    // A later retry works once the server recovers
    chat.transport.clear_failures();
    chat.gateway.edit_message(&q, "revised").await.unwrap();
    chat.gateway
        .with_tree(|tree| assert_eq!(tree.get(&q).unwrap().message, "revised"));
}

#[tokio::test]
async fn test_rejected_delete_restores_subtree() {
    let chat = chat();
    let q = user_turn(&chat, &chat.root_id, "keep me").await;
    let a = assistant_turn(&chat, &q, "and me").await;
    let before = chat.gateway.with_tree(Clone::clone);

    chat.transport.fail_deletes("conflict");
    chat.gateway.delete_message(&q).await.unwrap_err();

    assert_eq!(chat.gateway.with_tree(Clone::clone), before);
    assert_eq!(chat.gateway.tail_id(), a);
}

// =============================================================================
// Test 4: the cancel-after-create race
// =============================================================================

#[tokio::test]
async fn test_cancel_races_inflight_create() {
    let chat = chat();
    let q = user_turn(&chat, &chat.root_id, "never mind").await;

    // Hold the placeholder create open, then cancel while it is in flight
    chat.transport.hold_creates();
    chat.controller.start(&q, chat.bot).unwrap();
    chat.controller.append("I was going to say");
    chat.controller.cancel();

    // Locally the session and placeholder are gone immediately
    assert!(!chat.controller.is_streaming());
    assert_eq!(chat.gateway.tail_id(), q);
    chat.gateway.with_tree(|tree| assert_eq!(tree.len(), 3));

    // The server confirms the create anyway; the client must undo it
    chat.transport.release_creates();
    let transport = chat.transport.clone();
    wait_until(move || !transport.deletes().is_empty()).await;

    let deletes = chat.transport.deletes();
    assert_eq!(deletes.len(), 1);
    assert!(!deletes[0].is_temporary());
    // No ghost node reappeared after the late confirmation
    chat.gateway.with_tree(|tree| assert_eq!(tree.len(), 3));
    assert_eq!(chat.gateway.tail_id(), q);

    // And the conversation continues normally afterwards
    let a = assistant_turn(&chat, &q, "ok, moving on").await;
    assert_eq!(chat.gateway.tail_id(), a);
}

// =============================================================================
// Test 5: rehydration from a server payload
// =============================================================================

#[tokio::test]
async fn test_hydrate_then_resume_streaming() {
    let chat = chat();

    // Build up some state, then serialize it as the server would store it
    let q = user_turn(&chat, &chat.root_id, "hello").await;
    let _a = assistant_turn(&chat, &q, "hi!").await;
    let payload = serde_json::to_string(&chat.gateway.with_tree(Clone::clone)).unwrap();

    // A fresh client rehydrates the same conversation
    let restored: ChatTree = serde_json::from_str(&payload).unwrap();
    assert_eq!(restored, chat.gateway.with_tree(Clone::clone));

    let speakers = Arc::new(SpeakerRegistry::new());
    let bot = speakers.insert(Speaker::new("assistant", false));
    let transport = Arc::new(ScriptedTransport::new());
    let gateway = OptimisticMutationGateway::new(restored, transport.clone());
    let scheduler = Arc::new(ManualScheduler::new());
    let controller = StreamingSessionController::new(
        gateway.clone(),
        speakers,
        StreamingBuffer::new(scheduler.clone()),
    );

    // Streaming picks up at the restored tail
    let tail = gateway.tail_id();
    controller.start(&tail, bot).unwrap();
    controller.append("welcome back");
    let outcome = controller.finalize().await.unwrap();
    let FinalizeOutcome::Persisted(id) = outcome else {
        panic!("expected persisted outcome");
    };
    gateway.with_tree(|tree| {
        assert_eq!(tree.get(&id).unwrap().parent_id.as_ref(), Some(&tail));
        assert_eq!(tree.get(&id).unwrap().message, "welcome back");
    });
}

// =============================================================================
// Test 6: deleting the active answer falls back to a sibling
// =============================================================================

#[tokio::test]
async fn test_delete_active_branch_falls_back_to_sibling() {
    let chat = chat();
    let q = user_turn(&chat, &chat.root_id, "two answers please").await;
    let first = assistant_turn(&chat, &q, "first").await;
    let second = assistant_turn(&chat, &q, "second").await;
    assert_eq!(chat.gateway.tail_id(), second);

    chat.gateway.delete_message(&second).await.unwrap();

    // The surviving sibling becomes the active branch and the tail
    assert_eq!(chat.gateway.tail_id(), first);
    chat.gateway.with_tree(|tree| {
        let question = tree.get(&q).unwrap();
        assert_eq!(question.child_ids, vec![first.clone()]);
        assert_eq!(question.active_child(), Some(&first));
    });
}
