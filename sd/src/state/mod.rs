//! Checkpointed service state and its remote mirror
//!
//! [`StateStore`] owns the authoritative state of each service and stamps every
//! applied mutation with a checkpoint. [`ClientReplica`] mirrors one service on
//! the other side of a transport and resyncs from a full snapshot whenever it
//! sees a gap.

mod messages;
mod model;
mod replica;
mod settings;
mod store;

pub use messages::{Commit, MutationEnvelope, ServiceInfo, Snapshot, StateError, StateResponse};
pub use model::{Mutation, StateModel};
pub use replica::{ClientReplica, CommitOutcome, ReplicaDriver, SyncOutcome, SyncSource};
pub use settings::{SETTINGS_SERVICE, SettingsMutation, SettingsState};
pub use store::{DEFAULT_COMMIT_CAPACITY, StateHandle, StateStore};
