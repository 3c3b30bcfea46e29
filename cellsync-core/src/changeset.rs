//! Actors and change-sets, the unit of replication.
//!
//! Encoding (bincode, standard config):
//! ```text
//! ┌────────────┬──────────┬───────────────────────────────────────┐
//! │ actor (16B)│ seq (var)│ fragments: len ‖ (len ‖ yrs update)*  │
//! └────────────┴──────────┴───────────────────────────────────────┘
//! ```
//! Every fragment is a v1 update produced by one committed transaction; the
//! length prefixes make the payload self-delimiting.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{CollabError, Result};


/// Unique identity of one editing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(Uuid);

impl ActorId {
    /// Fresh random actor (UUID v4).
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// CRDT client id derived from the actor.
    ///
    /// Every replica derives the same id for the same actor, so tie-breaks
    /// between concurrent inserts resolve identically everywhere. The id
    /// stays within 32 bits; wider ids do not survive the update encoding
    /// intact and replicas then order concurrent entries differently.
    pub fn client_id(&self) -> u64 {
        (self.0.as_u128() as u32) as u64
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for ActorId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// One atomic local change (or a batch of them) ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// The actor that produced the change.
    pub actor: ActorId,
    /// Actor-scoped logical clock, strictly increasing from 1.
    pub seq: u64,
    /// Encoded CRDT updates, in commit order.
    pub fragments: Vec<Vec<u8>>,
}

impl ChangeSet {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Encode(e.to_string()))
    }

    /// Decode a change-set; trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (change_set, consumed): (ChangeSet, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CollabError::Decode(e.to_string()))?;
        if consumed != bytes.len() {
            return Err(CollabError::Decode(format!(
                "{} trailing bytes after change-set",
                bytes.len() - consumed
            )));
        }
        Ok(change_set)
    }

    /// Total payload size of all fragments.
    pub fn payload_len(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let cs = ChangeSet {
            actor: ActorId::new(),
            seq: 42,
            fragments: vec![vec![1, 2, 3], vec![], vec![9; 300]],
        };
        let bytes = cs.encode().unwrap();
        assert_eq!(ChangeSet::decode(&bytes).unwrap(), cs);
        assert_eq!(cs.payload_len(), 303);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(ChangeSet::decode(&[0xFF, 0x01]), Err(CollabError::Decode(_))));

        let mut bytes = ChangeSet { actor: ActorId::new(), seq: 1, fragments: vec![] }
            .encode()
            .unwrap();
        bytes.push(0);
        assert!(matches!(ChangeSet::decode(&bytes), Err(CollabError::Decode(_))));
    }

    #[test]
    fn test_client_id_is_stable_and_bounded() {
        let actor = ActorId::new();
        assert_eq!(actor.client_id(), ActorId::from_uuid(*actor.as_uuid()).client_id());
        assert!(actor.client_id() <= u32::MAX as u64);

        let wide = ActorId::from_uuid(Uuid::from_u128(0xdead_beef_0000_0001_ffff_ffff_1234_5678));
        assert_eq!(wide.client_id(), 0x1234_5678);
    }
}
