//! Server instance identifier.
//!
//! Every server in a fleet registers under an [`InstanceId`] in the liveness
//! directory and stamps it into the locks it takes. Validation happens here,
//! at the config boundary. Backends trust the value afterwards.

use serde::Deserialize;

use crate::error::CoordinationError;

/// A non-empty identifier without whitespace or control characters.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Result<Self, CoordinationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(CoordinationError::InvalidConfig("instance id is empty".into()));
        }
        if let Some(ch) = id.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(CoordinationError::InvalidConfig(format!(
                "invalid character {ch:?} in instance id '{id}'"
            )));
        }
        Ok(Self(id))
    }

    /// `tabula-<8 hex chars>`, for deployments that don't name their servers.
    pub fn random() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("tabula-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for InstanceId {
    type Error = CoordinationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_whitespace() {
        assert!(InstanceId::new("").is_err());
        assert!(InstanceId::new("node 1").is_err());
        assert!(InstanceId::new("node-1").is_ok());
    }

    #[test]
    fn random_ids_are_valid_and_distinct() {
        let a = InstanceId::random();
        let b = InstanceId::random();
        assert!(a.as_str().starts_with("tabula-"));
        assert_ne!(a, b);
        assert!(InstanceId::new(a.as_str()).is_ok());
    }
}
