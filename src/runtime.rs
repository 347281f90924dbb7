//! Container runtime abstraction
//!
//! The reconciler and the event watcher only talk to the runtime through
//! [`ContainerRuntime`], so the Docker client can be swapped for an in-memory
//! runtime in tests.

use crate::error::{DiscoveryError, EventStreamError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A running container that declared a routable hostname, valid for one discovery pass
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRecord {
    pub id: String,
    /// Display name without the leading `/`
    pub name: String,
    /// Normalized value of the hostname label
    pub hostname: String,
    pub labels: HashMap<String, String>,
    /// Address on the watched network
    pub ip: IpAddr,
    /// Port resolved from the upstream label
    pub port: u16,
    /// Creation time (unix seconds), used to pick a winner on hostname conflicts
    pub created: i64,
}

impl ContainerRecord {
    pub fn upstream(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Lifecycle actions that can change the routable container set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Die,
    Destroy,
}

impl ContainerAction {
    pub const ALL: [ContainerAction; 4] = [
        ContainerAction::Start,
        ContainerAction::Stop,
        ContainerAction::Die,
        ContainerAction::Destroy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Die => "die",
            ContainerAction::Destroy => "destroy",
        }
    }

    pub fn parse(action: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == action)
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded lifecycle event; only used as a reconciliation trigger
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEvent {
    pub action: ContainerAction,
    pub container_id: String,
}

/// Lazily decoded events bound to one streaming connection; dropping it closes the connection
pub type EventStream = BoxStream<'static, Result<RuntimeEvent, EventStreamError>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List running containers carrying the hostname label and attached to `network`
    async fn list_labeled_containers(
        &self,
        network: &str,
    ) -> Result<Vec<ContainerRecord>, DiscoveryError>;

    /// Open a new subscription to container lifecycle events
    fn events(&self) -> EventStream;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_action_parse() {
        assert_eq!(ContainerAction::parse("start"), Some(ContainerAction::Start));
        assert_eq!(ContainerAction::parse("destroy"), Some(ContainerAction::Destroy));
        assert_eq!(ContainerAction::parse("pause"), None);
        assert_eq!(ContainerAction::Die.to_string(), "die");
    }

    #[test]
    fn test_record_upstream() {
        let record = ContainerRecord {
            id: "abc".to_string(),
            name: "web".to_string(),
            hostname: "app.local".to_string(),
            labels: HashMap::new(),
            ip: "172.18.0.5".parse().unwrap(),
            port: 3001,
            created: 0,
        };
        assert_eq!(record.upstream().to_string(), "172.18.0.5:3001");
    }
}
