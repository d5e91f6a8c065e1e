//! Types shared by the parameter store, its RPC surface, and the client mirror.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Parameter values are opaque to the control plane.
pub type ParameterValue = serde_json::Value;

/// Identity of one client mirror, stable for the mirror's lifetime.
///
/// The server scopes change queues and listener registrations by session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Attributes fixed when a parameter is registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterAttributes {
    /// Clients may keep a local copy and rely on change notifications.
    pub cacheable: bool,
    /// Eligible for reset-to-default.
    pub restorable: bool,
    /// Eligible for persistence.
    pub loggable: bool,
}

impl ParameterAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cacheable(mut self, enable: bool) -> Self {
        self.cacheable = enable;
        self
    }

    pub fn restorable(mut self, enable: bool) -> Self {
        self.restorable = enable;
        self
    }

    pub fn loggable(mut self, enable: bool) -> Self {
        self.loggable = enable;
        self
    }
}

/// One entry of the inventory returned by `init_parameter_sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub name: String,
    pub value: ParameterValue,
    pub cacheable: bool,
    pub restorable: bool,
    pub loggable: bool,
}

/// A change event queued for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterChange {
    pub name: String,
    pub value: ParameterValue,
}

impl ParameterChange {
    pub fn new(name: impl Into<String>, value: ParameterValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}
