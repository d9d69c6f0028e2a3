//! Container data types and creation parameters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::{ContainerError, ContainerResult};

/// Go template handed to `ps --format`: one JSON object per container.
pub(crate) const PS_FORMAT: &str = "{{json .}}";

/// A container as reported by the engine's `ps` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Engine-generated identifier.
    pub id: String,
    /// Container names, without the leading `/` some engines add.
    pub names: Vec<String>,
    /// Image the container was created from.
    pub image: String,
    /// Container-side ports, exposed or published, in listing order.
    pub ports: Vec<u16>,
    /// Engine state string (e.g. "running").
    pub state: String,
}

/// One `ps --format '{{json .}}'` line. Docker reports names and ports as
/// display strings, podman as arrays.
#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "ID", alias = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: PsNames,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Ports", default)]
    ports: PsPorts,
    #[serde(rename = "State", default)]
    state: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum PsNames {
    #[default]
    None,
    Joined(String),
    List(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum PsPorts {
    #[default]
    None,
    Display(String),
    Mappings(Vec<PortMapping>),
}

/// Podman port mapping; `range` counts the ports starting at `container_port`.
#[derive(Debug, Deserialize)]
struct PortMapping {
    container_port: u16,
    #[serde(default)]
    range: Option<u16>,
}

impl Container {
    /// Primary name of the container.
    pub fn name(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    /// Parse one line of `ps --format PS_FORMAT` output.
    pub(crate) fn from_ps_json(line: &str) -> ContainerResult<Self> {
        let entry: PsEntry = serde_json::from_str(line)
            .map_err(|e| ContainerError::ParseError(format!("{e} in '{line}'")))?;
        if entry.id.is_empty() {
            return Err(ContainerError::ParseError(format!(
                "empty container id in '{line}'"
            )));
        }

        let names = match entry.names {
            PsNames::None => Vec::new(),
            PsNames::Joined(joined) => joined.split(',').map(str::to_string).collect(),
            PsNames::List(list) => list,
        };
        let names = names
            .iter()
            .map(|name| name.trim().trim_start_matches('/'))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        let ports = match entry.ports {
            PsPorts::None => Vec::new(),
            PsPorts::Display(column) => parse_ports(&column),
            PsPorts::Mappings(mappings) => {
                let mut ports = Vec::new();
                for mapping in mappings {
                    let count = mapping.range.unwrap_or(1).max(1);
                    let last = mapping.container_port.saturating_add(count - 1);
                    for port in mapping.container_port..=last {
                        if !ports.contains(&port) {
                            ports.push(port);
                        }
                    }
                }
                ports
            }
        };

        Ok(Self {
            id: entry.id,
            names,
            image: entry.image,
            ports,
            state: entry.state,
        })
    }
}

/// Extract container-side ports from the engine's `Ports` column.
///
/// Handles exposed ports (`5904/tcp`), published ports
/// (`0.0.0.0:5904->5904/tcp`, `[::]:5904->5904/tcp`) and ranges
/// (`5900-5902/tcp`). Duplicate entries (IPv4 and IPv6 bindings of the same
/// port) are reported once.
pub fn parse_ports(column: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for entry in column.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let container_side = entry.rsplit("->").next().unwrap_or(entry);
        let spec = container_side.split('/').next().unwrap_or(container_side);

        let range = match spec.split_once('-') {
            Some((start, end)) => start.parse::<u16>().ok().zip(end.parse::<u16>().ok()),
            None => spec.parse::<u16>().ok().map(|p| (p, p)),
        };

        if let Some((start, end)) = range {
            for port in start..=end {
                if !ports.contains(&port) {
                    ports.push(port);
                }
            }
        }
    }
    ports
}

/// A mount attached to a new container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// A volume provided by a named volume driver (e.g. the rclone plugin).
    Volume {
        driver: String,
        options: BTreeMap<String, String>,
        target: String,
    },
    /// A host directory bound into the container.
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
}

impl Mount {
    fn target(&self) -> &str {
        match self {
            Mount::Volume { target, .. } | Mount::Bind { target, .. } => target,
        }
    }

    /// Render as a `--mount` argument.
    pub(crate) fn to_mount_arg(&self) -> String {
        match self {
            Mount::Volume {
                driver,
                options,
                target,
            } => {
                let mut arg = format!("type=volume,dst={target},volume-driver={driver}");
                for (key, value) in options {
                    arg.push_str(&format!(",volume-opt={key}={value}"));
                }
                arg
            }
            Mount::Bind {
                source,
                target,
                read_only,
            } => {
                let mut arg = format!("type=bind,src={source},dst={target}");
                if *read_only {
                    arg.push_str(",readonly");
                }
                arg
            }
        }
    }

    fn validate(&self) -> ContainerResult<()> {
        let target = self.target();
        if !target.starts_with('/') {
            return Err(ContainerError::InvalidInput(format!(
                "mount target '{target}' must be an absolute path"
            )));
        }

        let mut fields: Vec<&str> = vec![target];
        match self {
            Mount::Volume {
                driver, options, ..
            } => {
                if driver.is_empty() {
                    return Err(ContainerError::InvalidInput(
                        "volume driver cannot be empty".to_string(),
                    ));
                }
                fields.push(driver);
                for (key, value) in options {
                    fields.push(key);
                    fields.push(value);
                }
            }
            Mount::Bind { source, .. } => {
                if !source.starts_with('/') {
                    return Err(ContainerError::InvalidInput(format!(
                        "bind source '{source}' must be an absolute path"
                    )));
                }
                fields.push(source);
            }
        }

        // `--mount` is a comma separated list of key=value pairs.
        if let Some(bad) = fields.iter().find(|f| f.contains(',') || f.contains('\n')) {
            return Err(ContainerError::InvalidInput(format!(
                "mount field '{bad}' contains a forbidden character"
            )));
        }

        Ok(())
    }
}

/// Parameters for creating a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Image to create the container from.
    pub image: String,
    /// Container name, used later to find the container again.
    pub name: Option<String>,
    /// Container-side ports to expose (not published on the host).
    pub exposed_ports: Vec<u16>,
    /// Network to attach the container to.
    pub network: Option<String>,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Command and arguments run by the container.
    pub command: Vec<String>,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn expose(mut self, port: u16) -> Self {
        self.exposed_ports.push(port);
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command.extend(args.into_iter().map(Into::into));
        self
    }

    /// Validate all fields before they are handed to the engine CLI.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }
        if let Some(ref network) = self.network {
            validate_container_name(network)?;
        }
        if self.exposed_ports.contains(&0) {
            return Err(ContainerError::InvalidInput(
                "exposed port cannot be 0".to_string(),
            ));
        }
        for mount in &self.mounts {
            mount.validate()?;
        }
        for key in self.env.keys().chain(self.labels.keys()) {
            if key.is_empty() || key.contains('=') {
                return Err(ContainerError::InvalidInput(format!(
                    "invalid env or label key '{key}'"
                )));
            }
        }

        Ok(())
    }

    /// Build the `create` argument list (everything after the binary).
    pub(crate) fn create_args(&self) -> Vec<String> {
        let mut args = vec!["create".to_string()];

        if let Some(ref name) = self.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }
        if let Some(ref network) = self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for port in &self.exposed_ports {
            args.push("--expose".to_string());
            args.push(format!("{port}/tcp"));
        }
        for mount in &self.mounts {
            args.push("--mount".to_string());
            args.push(mount.to_mount_arg());
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Validate an image reference such as `registry/name:tag`.
pub(crate) fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.starts_with('-') {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{image}' cannot start with '-'"
        )));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@');
    if !image.chars().all(valid) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Validate a container ID, container name or network name.
pub(crate) fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }
    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{name}' must start with a letter or digit"
        )));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !name.chars().all(valid) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}
