use crate::error::{GenrelayError, GenrelayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier assigned by the durable store once a message is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub u64);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-local placeholder for a message that has no durable record yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EphemeralToken(pub Uuid);

impl EphemeralToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EphemeralToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EphemeralToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a logical message.
///
/// A message starts `Ephemeral` when a turn begins and becomes `Permanent`
/// once the store write that owns it succeeds. Only a permanent identity can
/// be used as a store key; [`MessageIdentity::store_id`] is the single way to
/// get one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum MessageIdentity {
    /// Placeholder assigned before any durable write.
    Ephemeral(EphemeralToken),
    /// Store-assigned identity.
    Permanent(StoreId),
}

impl MessageIdentity {
    /// A fresh ephemeral identity.
    pub fn ephemeral() -> Self {
        Self::Ephemeral(EphemeralToken::new())
    }

    pub fn store_id(&self) -> Option<StoreId> {
        match self {
            Self::Permanent(id) => Some(*id),
            Self::Ephemeral(_) => None,
        }
    }

    pub fn token(&self) -> Option<EphemeralToken> {
        match self {
            Self::Ephemeral(token) => Some(*token),
            Self::Permanent(_) => None,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Promote an ephemeral identity to a permanent one.
    ///
    /// Promotion happens exactly once: promoting an already permanent
    /// identity is an error, even to the same id.
    pub fn promote(self, id: StoreId) -> GenrelayResult<Self> {
        match self {
            Self::Ephemeral(_) => Ok(Self::Permanent(id)),
            Self::Permanent(existing) => Err(GenrelayError::Identity(format!(
                "message {existing} is already permanent, cannot promote to {id}"
            ))),
        }
    }
}

impl fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ephemeral(token) => write!(f, "ephemeral:{token}"),
            Self::Permanent(id) => write!(f, "permanent:{id}"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_has_no_store_id() {
        let identity = MessageIdentity::ephemeral();
        assert!(identity.store_id().is_none());
        assert!(identity.token().is_some());
        assert!(!identity.is_permanent());
    }

    #[test]
    fn test_promote_once() {
        let promoted = MessageIdentity::ephemeral().promote(StoreId(42)).unwrap();
        assert_eq!(promoted.store_id(), Some(StoreId(42)));
        assert!(promoted.token().is_none());

        let err = promoted.promote(StoreId(42)).unwrap_err();
        assert!(matches!(err, GenrelayError::Identity(_)));
    }

    #[test]
    fn test_identity_serialization() {
        let identity = MessageIdentity::Permanent(StoreId(7));
        let json = serde_json::to_value(identity).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "permanent", "id": 7}));

        let back: MessageIdentity = serde_json::from_value(json).unwrap();
        assert_eq!(back, identity);
    }
}
