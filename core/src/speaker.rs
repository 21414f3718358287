//! Speaker Records
//!
//! Every message in the tree is attributed to a speaker: the human user or
//! one of possibly several bot personas. Speakers are owned by the
//! [`SpeakerRegistry`] and are immutable except by explicit rename.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a speaker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpeakerId(pub Uuid);

impl SpeakerId {
    /// Create a new unique speaker ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SpeakerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A participant in the conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Speaker {
    /// Unique speaker identifier
    pub id: SpeakerId,
    /// Display name
    pub name: String,
    /// Whether this speaker is the human user
    pub is_user: bool,
    /// Optional avatar reference (opaque to this crate; resolved by renderers)
    pub avatar: Option<String>,
    /// Optional display color (hex string, e.g. "#a0c4ff")
    pub color: Option<String>,
}

impl Speaker {
    /// Create a new speaker with a fresh ID
    #[must_use]
    pub fn new(name: impl Into<String>, is_user: bool) -> Self {
        Self {
            id: SpeakerId::new(),
            name: name.into(),
            is_user,
            avatar: None,
            color: None,
        }
    }

    /// Set the avatar reference
    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    /// Set the display color
    #[must_use]
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// Registry of all speakers known to the current chat
///
/// The registry is shared read-mostly state: renderers resolve speaker ids
/// through it while the session controller checks that a streaming speaker
/// actually exists. Rename is the only mutation a speaker record permits.
#[derive(Debug, Default)]
pub struct SpeakerRegistry {
    speakers: RwLock<HashMap<SpeakerId, Speaker>>,
}

impl SpeakerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a speaker, returning its ID
    pub fn insert(&self, speaker: Speaker) -> SpeakerId {
        let id = speaker.id;
        self.speakers.write().insert(id, speaker);
        id
    }

    /// Look up a speaker by ID
    #[must_use]
    pub fn get(&self, id: SpeakerId) -> Option<Speaker> {
        self.speakers.read().get(&id).cloned()
    }

    /// Check whether a speaker exists
    #[must_use]
    pub fn contains(&self, id: SpeakerId) -> bool {
        self.speakers.read().contains_key(&id)
    }

    /// Rename a speaker
    ///
    /// Returns false if the speaker does not exist.
    pub fn rename(&self, id: SpeakerId, name: impl Into<String>) -> bool {
        match self.speakers.write().get_mut(&id) {
            Some(speaker) => {
                speaker.name = name.into();
                true
            }
            None => false,
        }
    }

    /// Number of registered speakers
    #[must_use]
    pub fn len(&self) -> usize {
        self.speakers.read().len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.speakers.read().is_empty()
    }
}
