//! StateModel - the closed set of mutations a service state accepts

use std::fmt::Debug;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A mutation command
///
/// Implemented by an enum serialized as `#[serde(tag = "type", content = "payload")]`,
/// so the wire `type` field is exactly the set of variants. `name` must return
/// the same string serde writes into `type`.
pub trait Mutation: Serialize + DeserializeOwned + Debug + Clone + Send + Sync + 'static {
    fn name(&self) -> &'static str;
}

/// A service state and its reducer
///
/// The state is only ever changed through [`StateModel::apply`]. The snapshot
/// sent to clients is the serde serialization of the state.
pub trait StateModel: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Mutation: Mutation;

    fn apply(&mut self, mutation: &Self::Mutation);
}
