//! Session discovery from the container inventory.
//!
//! The container engine is the only index of sessions: a session exists
//! exactly when a running container named `<prefix><username>` exists.

use std::collections::BTreeSet;

use log::{debug, warn};
use serde::Serialize;

use crate::container::{Container, ContainerResult, ContainerRuntimeApi};
use crate::ports::PortRange;

/// A running session container found in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContainer {
    pub username: String,
    #[serde(rename = "portNumber")]
    pub port: u16,
    pub container_id: String,
}

/// Result of looking a username up in one inventory snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionLookup {
    /// The user's session, if one is running.
    pub existing: Option<SessionContainer>,
    /// Ports held by any session container in the snapshot.
    pub occupied: BTreeSet<u16>,
}

/// Reads session state out of the container engine's listing.
#[derive(Debug, Clone)]
pub struct InventoryScanner {
    name_prefix: String,
    ports: PortRange,
}

impl InventoryScanner {
    pub fn new(name_prefix: impl Into<String>, ports: PortRange) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            ports,
        }
    }

    /// Container name for a user's session.
    pub fn container_name(&self, username: &str) -> String {
        format!("{}{}", self.name_prefix, username)
    }

    /// Username encoded in a session container's name, if it is one.
    pub fn username_of<'a>(&self, container_name: &'a str) -> Option<&'a str> {
        container_name
            .trim_start_matches('/')
            .strip_prefix(self.name_prefix.as_str())
            .filter(|username| !username.is_empty())
    }

    /// The session port of a container: the first exposed port inside the
    /// session range, or failing that its first port.
    fn session_port(&self, container: &Container) -> Option<u16> {
        container
            .ports
            .iter()
            .copied()
            .find(|port| self.ports.contains(*port))
            .or_else(|| container.ports.first().copied())
    }

    /// All session containers in the current inventory.
    pub async fn list_sessions(
        &self,
        runtime: &dyn ContainerRuntimeApi,
    ) -> ContainerResult<Vec<SessionContainer>> {
        let containers = runtime.list_containers().await?;
        Ok(self.sessions_in(&containers))
    }

    fn sessions_in(&self, containers: &[Container]) -> Vec<SessionContainer> {
        let mut sessions = Vec::new();
        for container in containers {
            let Some(username) = container.name().and_then(|name| self.username_of(name)) else {
                continue;
            };
            let Some(port) = self.session_port(container) else {
                warn!(
                    "Session container {} ({}) exposes no port; ignoring it",
                    container.id, username
                );
                continue;
            };
            sessions.push(SessionContainer {
                username: username.to_string(),
                port,
                container_id: container.id.clone(),
            });
        }
        sessions
    }

    /// Look up `username` in a fresh inventory snapshot.
    ///
    /// If the engine somehow lists more than one session container for the
    /// same user, the first in listing order wins and the rest are logged.
    pub async fn find_session(
        &self,
        runtime: &dyn ContainerRuntimeApi,
        username: &str,
    ) -> ContainerResult<SessionLookup> {
        let containers = runtime.list_containers().await?;
        Ok(self.lookup_in(&containers, username))
    }

    fn lookup_in(&self, containers: &[Container], username: &str) -> SessionLookup {
        let mut lookup = SessionLookup::default();

        for session in self.sessions_in(containers) {
            lookup.occupied.insert(session.port);
            if session.username != username {
                continue;
            }
            match lookup.existing {
                None => {
                    debug!("Found session for {} on port {}", username, session.port);
                    lookup.existing = Some(session);
                }
                Some(ref first) => {
                    warn!(
                        "Multiple session containers for {}: using {} (port {}), ignoring {} (port {})",
                        username, first.container_id, first.port, session.container_id, session.port
                    );
                }
            }
        }

        lookup
    }
}
