//! Known participants of a collaboration session.
//!
//! The registry is append-only: the first record seen for an actor is kept
//! for the lifetime of the document. The local participant's entry exists
//! from construction.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::changeset::ActorId;
use crate::signal::Signal;

/// Colors assigned to collaborators, indexed by actor id.
pub const PALETTE: [&str; 12] = [
    "#e53935", "#8e24aa", "#3949ab", "#039be5", "#00897b", "#7cb342", "#fdd835", "#fb8c00",
    "#6d4c41", "#546e7a", "#d81b60", "#5e35b1",
];

const ANONYMOUS_NAMES: [&str; 12] = [
    "Ananke", "Callisto", "Deimos", "Europa", "Ganymede", "Io", "Mimas", "Oberon", "Phobos",
    "Rhea", "Titan", "Triton",
];

/// Identity of one participant. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub user_id: String,
    pub session_id: ActorId,
    pub display_name: String,
    pub short_name: String,
    pub color: String,
}

impl Collaborator {
    pub fn new(user_id: impl Into<String>, session_id: ActorId, display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        Self {
            user_id: user_id.into(),
            short_name: short_name(&display_name),
            color: color_for(&session_id).to_string(),
            session_id,
            display_name,
        }
    }

    /// Record for an actor known only by id.
    pub fn anonymous(session_id: ActorId) -> Self {
        let idx = palette_index(&session_id, ANONYMOUS_NAMES.len());
        let name = format!("Anonymous {}", ANONYMOUS_NAMES[idx]);
        Self::new(session_id.to_string(), session_id, name)
    }
}

fn palette_index(actor: &ActorId, len: usize) -> usize {
    (actor.as_uuid().as_u128() % len as u128) as usize
}

/// Palette color for an actor. Random v4 ids make the choice effectively random.
pub fn color_for(actor: &ActorId) -> &'static str {
    PALETTE[palette_index(actor, PALETTE.len())]
}

/// Initials of the first two words, upper-cased.
fn short_name(display_name: &str) -> String {
    let initials: String = display_name
        .split_whitespace()
        .filter_map(|word| word.chars().next())
        .take(2)
        .flat_map(char::to_uppercase)
        .collect();
    if initials.is_empty() {
        "?".to_string()
    } else {
        initials
    }
}

/// Per-document collaborator table keyed by actor id.
pub struct CollaboratorRegistry {
    local: ActorId,
    entries: RefCell<BTreeMap<ActorId, Collaborator>>,
    added: Signal<Collaborator>,
}

impl CollaboratorRegistry {
    pub fn new(local: Collaborator) -> Self {
        let actor = local.session_id;
        let mut entries = BTreeMap::new();
        entries.insert(actor, local);
        Self {
            local: actor,
            entries: RefCell::new(entries),
            added: Signal::new(),
        }
    }

    pub fn local_actor(&self) -> ActorId {
        self.local
    }

    /// The owning process's own entry.
    pub fn local(&self) -> Collaborator {
        self.entries
            .borrow()
            .get(&self.local)
            .cloned()
            .unwrap_or_else(|| Collaborator::anonymous(self.local))
    }

    pub fn get(&self, actor: &ActorId) -> Option<Collaborator> {
        self.entries.borrow().get(actor).cloned()
    }

    pub fn contains(&self, actor: &ActorId) -> bool {
        self.entries.borrow().contains_key(actor)
    }

    /// Register a collaborator. Returns `false` (and changes nothing) if the
    /// actor is already known.
    pub fn set(&self, collaborator: Collaborator) -> bool {
        {
            let mut entries = self.entries.borrow_mut();
            if entries.contains_key(&collaborator.session_id) {
                return false;
            }
            log::debug!(
                "registered collaborator {} ({})",
                collaborator.display_name,
                collaborator.session_id
            );
            entries.insert(collaborator.session_id, collaborator.clone());
        }
        self.added.emit(&collaborator);
        true
    }

    /// Return the record for `actor`, synthesizing an anonymous one first if
    /// the actor has never been seen.
    pub fn ensure(&self, actor: ActorId) -> Collaborator {
        if let Some(existing) = self.get(&actor) {
            return existing;
        }
        let synthesized = Collaborator::anonymous(actor);
        self.set(synthesized.clone());
        synthesized
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Snapshot of every known collaborator, ordered by actor id.
    pub fn all(&self) -> Vec<Collaborator> {
        self.entries.borrow().values().cloned().collect()
    }

    /// Fired once for every newly registered collaborator.
    pub fn added(&self) -> &Signal<Collaborator> {
        &self.added
    }
}
