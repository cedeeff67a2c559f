use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AmError, AmResult};

/// The identity the resource manager assigns to a container.
/// Opaque to the application master: equality-comparable and
/// stringifiable, nothing else is assumed about its shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContainerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mints monotonically increasing sequence numbers for synthetic
/// container identities.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next_value: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self { next_value: 1 }
    }

    pub fn next(&mut self) -> AmResult<u64> {
        let value = self.next_value;
        self.next_value = value
            .checked_add(1)
            .ok_or_else(|| AmError::InternalState("ID overflow".to_string()))?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_display() {
        let id = ContainerId::new("container_1408_0001_01_000002");
        assert_eq!(id.to_string(), "container_1408_0001_01_000002");
        assert_eq!(id, ContainerId::from("container_1408_0001_01_000002"));
    }

    #[test]
    fn test_id_generator_is_sequential() {
        let mut generator = IdGenerator::new();
        assert_eq!(generator.next().unwrap(), 1);
        assert_eq!(generator.next().unwrap(), 2);
    }
}
