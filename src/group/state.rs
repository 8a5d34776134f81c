//! Service State Payload

use serde::{Deserialize, Serialize};

use super::NodeState;

/// General-purpose member payload: a role, the owning container and the
/// endpoints it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    /// Role this member competes for
    pub id: String,
    /// Owning container, stable across reconnects
    pub container: String,
    /// Endpoints offered while master
    #[serde(default)]
    pub services: Vec<String>,
    /// When this state was announced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ServiceState {
    /// Create a new service state
    pub fn new(id: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            container: container.into(),
            services: Vec::new(),
            registered_at: None,
        }
    }

    /// Attach service endpoints
    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Stamp the announcement time
    pub fn stamped(mut self) -> Self {
        self.registered_at = Some(chrono::Utc::now());
        self
    }
}

impl NodeState for ServiceState {
    fn id(&self) -> &str {
        &self.id
    }

    fn container(&self) -> &str {
        &self.container
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.container)?;
        if !self.services.is_empty() {
            write!(f, " [{}]", self.services.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_display() {
        let state = ServiceState::new("broker", "node-1").with_services(["tcp://10.0.0.1:61616"]);
        assert_eq!(state.id(), "broker");
        assert_eq!(state.container(), "node-1");
        assert_eq!(state.to_string(), "broker@node-1 [tcp://10.0.0.1:61616]");
    }

    #[test]
    fn test_stamp_is_optional_on_the_wire() {
        let plain = serde_json::to_string(&ServiceState::new("a", "b")).unwrap();
        assert!(!plain.contains("registered_at"));

        let stamped = ServiceState::new("a", "b").stamped();
        assert!(stamped.registered_at.is_some());
    }
}
