//! Container watcher
//!
//! Translates container lifecycle events into route up/down events.
//! Containers opt in with a `VIRTUAL_HOST` environment variable (whitespace
//! separated hostnames); `VIRTUAL_PORT` selects the container-side port
//! (default 8080) and the matching host-side binding becomes the upstream
//! address.

use crate::config::{ConfigEntry, ConfigEvent};
use bollard::container::ListContainersOptions;
use bollard::models::PortBinding;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

/// Container port to route to when `VIRTUAL_PORT` is absent
const DEFAULT_VIRTUAL_PORT: &str = "8080";

pub struct DockerWatch {
    client: Docker,
}

impl DockerWatch {
    /// Connect to the local container runtime
    pub fn new() -> anyhow::Result<Self> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self { client })
    }

    /// Up events for every currently running container
    pub async fn active_containers(&self) -> anyhow::Result<Vec<ConfigEvent>> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String>::default()))
            .await?;

        let mut events = Vec::new();
        for container in containers {
            let Some(id) = container.id else { continue };
            match self.container_events(&id, true).await {
                Ok(mut container_events) => events.append(&mut container_events),
                Err(e) => warn!(container = %id, error = %e, "failed to inspect container"),
            }
        }
        Ok(events)
    }

    /// Follow the runtime's event stream, emitting one batch per
    /// start/stop event until the channel closes.
    pub async fn watch(self, tx: mpsc::Sender<Vec<ConfigEvent>>) {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let mut stream = self.client.events(Some(EventsOptions {
            filters,
            ..Default::default()
        }));

        while let Some(item) = stream.next().await {
            let message = match item {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "container event stream error");
                    continue;
                }
            };
            let up = match message.action.as_deref() {
                Some("start") => true,
                Some("stop") => false,
                _ => continue,
            };
            let Some(id) = message.actor.and_then(|a| a.id) else {
                continue;
            };
            match self.container_events(&id, up).await {
                Ok(events) if !events.is_empty() => {
                    if tx.send(events).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(container = %id, error = %e, "failed to inspect container"),
            }
        }
    }

    async fn container_events(&self, id: &str, up: bool) -> anyhow::Result<Vec<ConfigEvent>> {
        let inspect = self.client.inspect_container(id, None).await?;
        let env = inspect
            .config
            .and_then(|c| c.env)
            .unwrap_or_default();
        let ports = inspect
            .network_settings
            .and_then(|n| n.ports)
            .unwrap_or_default();
        entries_from_container(&env, &ports, up, id)
    }
}

/// Derive route events from a container's environment and port bindings.
///
/// Containers without `VIRTUAL_HOST` yield no events. When several bindings
/// expose the virtual port, the smallest host port wins so repeated
/// inspections stay stable.
pub(crate) fn entries_from_container(
    env: &[String],
    ports: &HashMap<String, Option<Vec<PortBinding>>>,
    up: bool,
    id: &str,
) -> anyhow::Result<Vec<ConfigEvent>> {
    let Some(virtual_host) = env_value(env, "VIRTUAL_HOST") else {
        return Ok(Vec::new());
    };
    let virtual_port =
        env_value(env, "VIRTUAL_PORT").unwrap_or_else(|| DEFAULT_VIRTUAL_PORT.to_string());

    let mut host_ports: Vec<u16> = Vec::new();
    for (key, bindings) in ports {
        let container_port = key.split('/').next().unwrap_or(key);
        if container_port != virtual_port {
            continue;
        }
        for binding in bindings.iter().flatten() {
            if let Some(port) = binding.host_port.as_deref().and_then(|p| p.parse().ok()) {
                host_ports.push(port);
            }
        }
    }
    let Some(host_port) = host_ports.into_iter().min() else {
        anyhow::bail!("no {:?} port bindings in container {:?}", virtual_port, id);
    };

    let target = Url::parse(&format!("http://localhost:{}", host_port))?;
    Ok(virtual_host
        .split_whitespace()
        .map(|hostname| ConfigEvent {
            entry: ConfigEntry {
                hostname: hostname.to_string(),
                target: target.clone(),
            },
            up,
        })
        .collect())
}

fn env_value(env: &[String], name: &str) -> Option<String> {
    env.iter().find_map(|kv| {
        kv.split_once('=')
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(
        entries: &[(&str, &[&str])],
    ) -> HashMap<String, Option<Vec<PortBinding>>> {
        let mut map = HashMap::new();
        for (port, host_ports) in entries {
            map.insert(
                port.to_string(),
                Some(
                    host_ports
                        .iter()
                        .map(|hp| PortBinding {
                            host_ip: Some("0.0.0.0".to_string()),
                            host_port: Some(hp.to_string()),
                        })
                        .collect(),
                ),
            );
        }
        map
    }

    #[test]
    fn test_container_without_virtual_host_is_ignored() {
        let env = vec!["PATH=/bin".to_string()];
        let ports = bindings(&[("8080/tcp", &["32010"])]);
        let events = entries_from_container(&env, &ports, true, "c1").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_virtual_port_defaults_to_8080() {
        let env = vec!["VIRTUAL_HOST=d.test".to_string()];
        let ports = bindings(&[("8080/tcp", &["32010"])]);
        let events = entries_from_container(&env, &ports, true, "c1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entry.target.as_str(), "http://localhost:32010/");
    }

    #[test]
    fn test_multiple_hostnames_emit_multiple_events() {
        let env = vec![
            "VIRTUAL_HOST=d.test e.test".to_string(),
            "VIRTUAL_PORT=80".to_string(),
        ];
        let ports = bindings(&[("80/tcp", &["32010"]), ("9000/tcp", &["32011"])]);
        let events = entries_from_container(&env, &ports, true, "c1").unwrap();
        assert_eq!(events.len(), 2);
        let hosts: Vec<&str> = events.iter().map(|e| e.entry.hostname.as_str()).collect();
        assert!(hosts.contains(&"d.test"));
        assert!(hosts.contains(&"e.test"));
        for event in &events {
            assert!(event.up);
            assert_eq!(event.entry.target.as_str(), "http://localhost:32010/");
        }
    }

    #[test]
    fn test_stop_event_emits_down() {
        let env = vec!["VIRTUAL_HOST=d.test".to_string(), "VIRTUAL_PORT=80".to_string()];
        let ports = bindings(&[("80/tcp", &["32010"])]);
        let events = entries_from_container(&env, &ports, false, "c1").unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].up);
    }

    #[test]
    fn test_missing_binding_is_an_error() {
        let env = vec!["VIRTUAL_HOST=d.test".to_string(), "VIRTUAL_PORT=80".to_string()];
        let ports = bindings(&[("9000/tcp", &["32011"])]);
        let err = entries_from_container(&env, &ports, true, "c1").unwrap_err();
        assert!(err.to_string().contains("port bindings"));
    }

    #[test]
    fn test_smallest_host_port_wins() {
        let env = vec!["VIRTUAL_HOST=d.test".to_string(), "VIRTUAL_PORT=80".to_string()];
        let mut ports = bindings(&[("80/tcp", &["32020", "32010"])]);
        ports.insert("80/udp".to_string(), None);
        let events = entries_from_container(&env, &ports, true, "c1").unwrap();
        assert_eq!(events[0].entry.target.as_str(), "http://localhost:32010/");
    }
}
