//! State sync wire types and errors
//!
//! Everything here crosses the transport as JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Service already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Service not ready: {0}")]
    NotReady(String),

    #[error("Cannot find mutation named {mutation} in service {service}")]
    MutationNotFound { service: String, mutation: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// A mutation as it travels on the wire: `{type, payload}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEnvelope {
    #[serde(rename = "type")]
    pub r#type: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl MutationEnvelope {
    pub fn new(r#type: impl Into<String>, payload: Value) -> Self {
        Self {
            r#type: r#type.into(),
            payload,
        }
    }

    /// Encode a typed mutation
    pub fn encode<M: Serialize>(mutation: &M) -> StateResponse<Self> {
        Ok(serde_json::from_value(serde_json::to_value(mutation)?)?)
    }

    /// Decode into a typed mutation; fails for mutation names `M` does not declare
    pub fn decode<M: serde::de::DeserializeOwned>(&self) -> StateResponse<M> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }
}

/// One applied mutation tagged with the checkpoint it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub service_name: String,
    pub mutation: MutationEnvelope,
    pub checkpoint: u64,
}

/// Full projection of a service state at a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: Value,
    pub checkpoint: u64,
}

/// Registered service and its current checkpoint (`None` while reserved)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub checkpoint: Option<u64>,
}
