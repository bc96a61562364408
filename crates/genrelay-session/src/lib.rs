pub mod reconciler;
pub mod store;

pub use reconciler::{AssociationOutcome, PersistenceReconciler, ReconcilerConfig, ReconcilerStats};
pub use store::{FileMessageStore, InMemoryMessageStore, MessageStore, StoredMessage};
