use crate::identity::StoreId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to a generated artifact (URL or blob key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable link between a generated artifact and the message that owns it.
///
/// For a given `store_id` each `prompt` appears at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactAssociation {
    /// The owning message.
    pub store_id: StoreId,
    /// Normalized prompt the artifact was generated from.
    pub prompt: String,
    /// The generated artifact.
    pub artifact_ref: ArtifactRef,
}

impl ArtifactAssociation {
    pub fn new(store_id: StoreId, prompt: impl Into<String>, artifact_ref: ArtifactRef) -> Self {
        Self {
            store_id,
            prompt: prompt.into(),
            artifact_ref,
        }
    }
}

/// Insert `association` into `rows`, replacing the row with the same prompt.
///
/// Returns `true` when a new row was appended, `false` when an existing row
/// was updated in place.
pub fn upsert_into(rows: &mut Vec<ArtifactAssociation>, association: ArtifactAssociation) -> bool {
    match rows.iter_mut().find(|row| row.prompt == association.prompt) {
        Some(row) => {
            row.artifact_ref = association.artifact_ref;
            false
        }
        None => {
            rows.push(association);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_into_appends_then_updates() {
        let mut rows = Vec::new();
        let first = ArtifactAssociation::new(StoreId(1), "cat", ArtifactRef::new("a"));
        assert!(upsert_into(&mut rows, first));

        let second = ArtifactAssociation::new(StoreId(1), "cat", ArtifactRef::new("b"));
        assert!(!upsert_into(&mut rows, second));

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].artifact_ref.as_str(), "b");
    }

    #[test]
    fn test_upsert_into_distinct_prompts() {
        let mut rows = Vec::new();
        upsert_into(&mut rows, ArtifactAssociation::new(StoreId(1), "cat", ArtifactRef::new("a")));
        upsert_into(&mut rows, ArtifactAssociation::new(StoreId(1), "dog", ArtifactRef::new("b")));
        assert_eq!(rows.len(), 2);
    }
}
