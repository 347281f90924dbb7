//! Docker-backed container discovery and event subscription

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, EventStreamError};
use crate::labels::{normalize_hostname, parse_port};
use crate::runtime::{ContainerAction, ContainerRecord, ContainerRuntime, EventStream, RuntimeEvent};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Client timeout handed to bollard; the reconciler applies its own tighter bound
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Discovers labeled containers through the Docker Engine API
pub struct DockerRuntime {
    client: Docker,
    host_label: String,
    upstream_label: String,
}

impl DockerRuntime {
    /// Create a client for the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Local defaults (`/var/run/docker.sock` on Linux)
    ///
    /// The socket is not contacted here; an unreachable daemon surfaces as a
    /// discovery error on each pass instead of failing startup.
    pub fn new(docker_host: Option<&str>, discovery: &DiscoveryConfig) -> anyhow::Result<Self> {
        let client = match docker_host {
            Some(host) => Self::connect_to_host(host)?,
            None => match std::env::var("DOCKER_HOST") {
                Ok(host) => Self::connect_to_host(&host)?,
                Err(_) => Docker::connect_with_local_defaults()
                    .map_err(|e| anyhow::anyhow!("Cannot create Docker client: {}", e))?,
            },
        };

        Ok(Self {
            client,
            host_label: discovery.host_label.clone(),
            upstream_label: discovery.upstream_label.clone(),
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    /// Check that the daemon answers; used for a startup diagnostic only
    pub async fn ping(&self) -> Result<(), DiscoveryError> {
        self.client.ping().await.map(|_| ()).map_err(classify_error)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_labeled_containers(
        &self,
        network: &str,
    ) -> Result<Vec<ContainerRecord>, DiscoveryError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![self.host_label.clone()]);
        filters.insert("network".to_string(), vec![network.to_string()]);

        let options = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(classify_error)?;

        debug!(network, count = summaries.len(), "Listed labeled containers");

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                record_from_summary(summary, network, &self.host_label, &self.upstream_label)
            })
            .collect())
    }

    fn events(&self) -> EventStream {
        let actions: Vec<String> = ContainerAction::ALL
            .iter()
            .map(|a| a.as_str().to_string())
            .collect();

        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert("event".to_string(), actions);

        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        self.client
            .events(Some(options))
            .map(|item| match item {
                Ok(message) => decode_event(message),
                Err(e) => Err(classify_stream_error(e)),
            })
            .boxed()
    }
}

/// Turn a container listing entry into a record, or skip it
///
/// Containers without a usable hostname label are skipped silently; containers
/// without an address on the watched network are skipped with a warning.
pub fn record_from_summary(
    summary: ContainerSummary,
    network: &str,
    host_label: &str,
    upstream_label: &str,
) -> Option<ContainerRecord> {
    let id = summary.id.unwrap_or_default();
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.chars().take(12).collect());
    let labels = summary.labels.unwrap_or_default();

    let raw_host = labels.get(host_label).map(String::as_str).unwrap_or("");
    if raw_host.trim().is_empty() {
        debug!(container = %name, "Container has no hostname label, skipping");
        return None;
    }
    let Some(hostname) = normalize_hostname(raw_host) else {
        warn!(container = %name, label = raw_host, "Hostname label is not a valid hostname, skipping");
        return None;
    };

    let ip = summary
        .network_settings
        .and_then(|settings| settings.networks)
        .and_then(|mut networks| networks.remove(network))
        .and_then(|endpoint| {
            endpoint
                .ip_address
                .filter(|ip| !ip.is_empty())
                .or(endpoint.global_ipv6_address.filter(|ip| !ip.is_empty()))
        });

    let Some(ip) = ip.and_then(|ip| ip.parse::<IpAddr>().ok()) else {
        warn!(
            container = %name,
            hostname,
            network,
            "Container has no address on the watched network, excluding from routes"
        );
        return None;
    };

    let port = parse_port(labels.get(upstream_label).map(String::as_str));

    Some(ContainerRecord {
        id,
        name,
        hostname,
        labels,
        ip,
        port,
        created: summary.created.unwrap_or(0),
    })
}

fn decode_event(message: EventMessage) -> Result<RuntimeEvent, EventStreamError> {
    let action = message
        .action
        .as_deref()
        .ok_or_else(|| EventStreamError::Malformed("event without action".to_string()))?;
    // Actions may carry a suffix such as "exec_start: sh"
    let action_name = action.split(':').next().unwrap_or(action).trim();
    let action = ContainerAction::parse(action_name)
        .ok_or_else(|| EventStreamError::Malformed(format!("unexpected action '{}'", action)))?;
    let container_id = message
        .actor
        .and_then(|actor| actor.id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| EventStreamError::Malformed("event without actor id".to_string()))?;

    Ok(RuntimeEvent {
        action,
        container_id,
    })
}

fn classify_error(err: bollard::errors::Error) -> DiscoveryError {
    use bollard::errors::Error;

    match &err {
        Error::DockerResponseServerError {
            status_code,
            message,
        } => DiscoveryError::ApiStatus {
            status: *status_code,
            message: message.clone(),
        },
        Error::JsonDataError { .. } | Error::JsonSerdeError { .. } => {
            DiscoveryError::Decode(err.to_string())
        }
        _ => DiscoveryError::SocketConnect(err.to_string()),
    }
}

fn classify_stream_error(err: bollard::errors::Error) -> EventStreamError {
    use bollard::errors::Error;

    match &err {
        Error::JsonDataError { .. } | Error::JsonSerdeError { .. } => {
            EventStreamError::Malformed(err.to_string())
        }
        _ => EventStreamError::Transport(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerSummaryNetworkSettings, EndpointSettings, EventActor};

    const HOST: &str = "dockgate.host";
    const UPSTREAM: &str = "dockgate.upstream";

    fn summary(labels: &[(&str, &str)], networks: &[(&str, &str)]) -> ContainerSummary {
        let networks = networks
            .iter()
            .map(|(name, ip)| {
                (
                    name.to_string(),
                    EndpointSettings {
                        ip_address: Some(ip.to_string()),
                        ..Default::default()
                    },
                )
            })
            .collect();

        ContainerSummary {
            id: Some("c0ffee".to_string()),
            names: Some(vec!["/web".to_string()]),
            created: Some(1_700_000_000),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            network_settings: Some(ContainerSummaryNetworkSettings {
                networks: Some(networks),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_record_with_template_port() {
        let s = summary(
            &[(HOST, "app.local"), (UPSTREAM, "{{upstreams 3001}}")],
            &[("web", "172.18.0.5")],
        );
        let record = record_from_summary(s, "web", HOST, UPSTREAM).unwrap();
        assert_eq!(record.hostname, "app.local");
        assert_eq!(record.name, "web");
        assert_eq!(record.upstream().to_string(), "172.18.0.5:3001");
        assert_eq!(record.created, 1_700_000_000);
    }

    #[test]
    fn test_record_defaults_port_80() {
        let s = summary(&[(HOST, "app.local")], &[("web", "172.18.0.5")]);
        let record = record_from_summary(s, "web", HOST, UPSTREAM).unwrap();
        assert_eq!(record.port, 80);
    }

    #[test]
    fn test_record_skipped_without_hostname() {
        let s = summary(&[(HOST, "  ")], &[("web", "172.18.0.5")]);
        assert!(record_from_summary(s, "web", HOST, UPSTREAM).is_none());

        let s = summary(&[], &[("web", "172.18.0.5")]);
        assert!(record_from_summary(s, "web", HOST, UPSTREAM).is_none());
    }

    #[test]
    fn test_record_skipped_without_network_ip() {
        let s = summary(&[(HOST, "app.local")], &[("other", "10.0.0.2")]);
        assert!(record_from_summary(s, "web", HOST, UPSTREAM).is_none());

        let s = summary(&[(HOST, "app.local")], &[("web", "")]);
        assert!(record_from_summary(s, "web", HOST, UPSTREAM).is_none());
    }

    #[test]
    fn test_decode_event() {
        let message = EventMessage {
            action: Some("destroy".to_string()),
            actor: Some(EventActor {
                id: Some("c0ffee".to_string()),
                attributes: None,
            }),
            ..Default::default()
        };
        let event = decode_event(message).unwrap();
        assert_eq!(event.action, ContainerAction::Destroy);
        assert_eq!(event.container_id, "c0ffee");
    }

    #[test]
    fn test_decode_event_rejects_incomplete() {
        let message = EventMessage {
            action: Some("start".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            decode_event(message),
            Err(EventStreamError::Malformed(_))
        ));

        let message = EventMessage {
            action: Some("pause".to_string()),
            actor: Some(EventActor {
                id: Some("c0ffee".to_string()),
                attributes: None,
            }),
            ..Default::default()
        };
        assert!(decode_event(message).is_err());
    }

    #[test]
    fn test_classify_status_error() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(matches!(
            classify_error(err),
            DiscoveryError::ApiStatus { status: 500, .. }
        ));
    }
}
