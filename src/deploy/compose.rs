//! Typed model of a `docker-compose.yml` file.
//!
//! Only the keys the deployment checks look at are modelled; everything else
//! in a service definition is ignored on load. Fields that the compose format
//! accepts in several shapes (short string or long mapping) are untagged
//! enums and get normalised by the `parse` helpers below.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{ExchangeError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Obsolete in current compose releases; accepted as either a string or a number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<serde_yaml::Value>,
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<serde_yaml::Value>>,
}

impl ComposeFile {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ExchangeError::Deploy(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub ports: Vec<PortEntry>,
    #[serde(default)]
    pub volumes: Vec<VolumeEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
}

impl Service {
    pub fn restart_policy(&self) -> Result<Option<RestartPolicy>> {
        self.restart.as_deref().map(RestartPolicy::parse).transpose()
    }

    pub fn port_mappings(&self) -> Vec<Result<PortMapping>> {
        self.ports.iter().map(PortEntry::to_mapping).collect()
    }

    pub fn volume_mounts(&self) -> Vec<Result<VolumeMount>> {
        self.volumes.iter().map(VolumeEntry::to_mount).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildSpec {
    Context(String),
    Detailed {
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        dockerfile: Option<String>,
    },
}

impl BuildSpec {
    pub fn context(&self) -> &str {
        match self {
            BuildSpec::Context(context) => context,
            BuildSpec::Detailed { context, .. } => context.as_deref().unwrap_or("."),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl Default for DependsOn {
    fn default() -> Self {
        DependsOn::List(Vec::new())
    }
}

impl DependsOn {
    pub fn names(&self) -> Vec<&str> {
        match self {
            DependsOn::List(names) => names.iter().map(String::as_str).collect(),
            DependsOn::Map(map) => map.keys().map(String::as_str).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().contains(&name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Map(BTreeMap::new())
    }
}

impl Environment {
    /// Raw `(key, value)` pairs before interpolation. `None` means the key is
    /// declared without a value and is taken from the deploying shell.
    pub fn entries(&self) -> Vec<(String, Option<String>)> {
        match self {
            Environment::Map(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), value.as_ref().and_then(scalar_to_string)))
                .collect(),
            Environment::List(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => (key.to_string(), Some(value.to_string())),
                    None => (item.clone(), None),
                })
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries()
            .into_iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v)
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortEntry {
    Short(String),
    Number(u16),
    Long {
        target: u16,
        #[serde(default)]
        published: Option<serde_yaml::Value>,
        #[serde(default)]
        host_ip: Option<String>,
        #[serde(default)]
        protocol: Option<String>,
    },
}

impl PortEntry {
    pub fn to_mapping(&self) -> Result<PortMapping> {
        match self {
            PortEntry::Short(raw) => PortMapping::parse(raw),
            PortEntry::Number(port) => Ok(PortMapping {
                host_ip: None,
                host: None,
                container: PortRange::single(*port),
                protocol: "tcp".to_string(),
            }),
            PortEntry::Long {
                target,
                published,
                host_ip,
                protocol,
            } => {
                let host = match published.as_ref().and_then(scalar_to_string) {
                    Some(raw) => Some(PortRange::parse(&raw)?),
                    None => None,
                };
                Ok(PortMapping {
                    host_ip: host_ip.clone(),
                    host,
                    container: PortRange::single(*target),
                    protocol: protocol.clone().unwrap_or_else(|| "tcp".to_string()),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let port = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|_| ExchangeError::Deploy(format!("invalid port '{raw}'")))
        };
        let range = match raw.split_once('-') {
            Some((start, end)) => Self {
                start: port(start)?,
                end: port(end)?,
            },
            None => Self::single(port(raw)?),
        };
        if range.start > range.end {
            return Err(ExchangeError::Deploy(format!("invalid port range '{raw}'")));
        }
        Ok(range)
    }

    pub fn len(&self) -> u32 {
        u32::from(self.end - self.start) + 1
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A `[host_ip:][host:]container[/protocol]` port mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host: Option<PortRange>,
    pub container: PortRange,
    pub protocol: String,
}

impl PortMapping {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || ExchangeError::Deploy(format!("invalid port mapping '{raw}'"));

        let (spec, protocol) = match raw.rsplit_once('/') {
            Some((spec, protocol)) if matches!(protocol, "tcp" | "udp" | "sctp") => {
                (spec, protocol.to_string())
            }
            Some(_) => return Err(invalid()),
            None => (raw, "tcp".to_string()),
        };

        // Split from the right so a bracketed IPv6 host address stays intact.
        let parts: Vec<&str> = spec.rsplitn(3, ':').collect();
        let (host_ip, host, container) = match parts.as_slice() {
            [container] => (None, None, *container),
            [container, host] => (None, Some(*host), *container),
            [container, host, ip] => (Some(ip.to_string()), Some(*host), *container),
            _ => return Err(invalid()),
        };
        if container.is_empty() {
            return Err(invalid());
        }

        let container = PortRange::parse(container).map_err(|_| invalid())?;
        let host = match host {
            Some("") | None => None,
            Some(h) => Some(PortRange::parse(h).map_err(|_| invalid())?),
        };
        if let Some(host) = host {
            if host.len() != container.len() {
                return Err(invalid());
            }
        }

        Ok(Self {
            host_ip,
            host,
            container,
            protocol,
        })
    }

    /// Host address with the wildcard forms folded together.
    pub fn bind_address(&self) -> &str {
        match self.host_ip.as_deref() {
            None | Some("") | Some("0.0.0.0") | Some("[::]") | Some("::") => "*",
            Some(ip) => ip,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeEntry {
    Short(String),
    Long {
        #[serde(default, rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        source: Option<String>,
        target: String,
        #[serde(default)]
        read_only: bool,
    },
}

impl VolumeEntry {
    pub fn to_mount(&self) -> Result<VolumeMount> {
        match self {
            VolumeEntry::Short(raw) => VolumeMount::parse(raw),
            VolumeEntry::Long {
                kind,
                source,
                target,
                read_only,
            } => {
                let mount = VolumeMount {
                    source: source.clone(),
                    target: target.clone(),
                    read_only: *read_only,
                };
                // An explicit bind of a relative name is still a bind.
                if kind.as_deref() == Some("bind") && mount.named_volume().is_some() {
                    return Ok(VolumeMount {
                        source: source.as_ref().map(|s| format!("./{s}")),
                        ..mount
                    });
                }
                Ok(mount)
            }
        }
    }
}

/// A `[source:]target[:mode]` volume mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub source: Option<String>,
    pub target: String,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || ExchangeError::Deploy(format!("invalid volume mount '{raw}'"));
        let parts: Vec<&str> = raw.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [target] => (None, *target, None),
            [source, target] => (Some(*source), *target, None),
            [source, target, mode] => (Some(*source), *target, Some(*mode)),
            _ => return Err(invalid()),
        };
        if target.is_empty() || !target.starts_with('/') {
            return Err(invalid());
        }
        if source == Some("") {
            return Err(invalid());
        }
        let read_only = match mode {
            None => false,
            Some(mode) => mode.split(',').any(|m| m == "ro"),
        };
        Ok(Self {
            source: source.map(str::to_string),
            target: target.to_string(),
            read_only,
        })
    }

    /// The volume name when the source refers to a named volume rather than
    /// a host path.
    pub fn named_volume(&self) -> Option<&str> {
        let source = self.source.as_deref()?;
        let is_path = source.starts_with('/')
            || source.starts_with('.')
            || source.starts_with('~')
            || source.contains('/');
        if is_path {
            None
        } else {
            Some(source)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure(Option<u32>),
    UnlessStopped,
}

impl RestartPolicy {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "no" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure(None)),
            other => other
                .strip_prefix("on-failure:")
                .and_then(|n| n.parse().ok())
                .map(|n| RestartPolicy::OnFailure(Some(n)))
                .ok_or_else(|| ExchangeError::Deploy(format!("invalid restart policy '{raw}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Healthcheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
}
