//! Connection registry.
//!
//! Connections are declared in a YAML file and validated eagerly when it is
//! loaded: every entry must name a host and user, carry exactly one
//! credential and, for key authentication, point at a readable key file.
//! A registry that loads successfully never fails a lookup for a reason
//! other than the name being absent.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sshmux_protocol::{ConnectionSummary, ErrorKind, ToolError};
use thiserror::Error;

use crate::config::expand_tilde;

/// Errors from loading the registry or looking things up in it.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("connection registry must contain a non-empty 'connections' mapping")]
    Empty,

    #[error("connection '{name}': invalid name, use only [A-Za-z0-9_.-]")]
    InvalidName { name: String },

    #[error("connection '{name}': '{field}' is required")]
    MissingField { name: String, field: &'static str },

    #[error("connection '{name}': port must be between 1 and 65535, got {port}")]
    InvalidPort { name: String, port: u64 },

    #[error("connection '{name}': set exactly one of 'key_path' or 'password'")]
    CredentialConflict { name: String },

    #[error("connection '{name}': key file not readable: {path}")]
    KeyNotReadable { name: String, path: PathBuf },

    #[error("unknown connection '{name}', available: {available}")]
    UnknownConnection { name: String, available: String },

    #[error("connection '{0}' has no info_file configured")]
    NoInfoConfigured(String),

    #[error("info file for connection '{name}' not readable: {path}")]
    InfoFileNotFound { name: String, path: PathBuf },
}

impl RegistryError {
    /// Wire classification. Load-time failures are configuration errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::UnknownConnection { .. } => ErrorKind::UnknownConnection,
            RegistryError::NoInfoConfigured(_) => ErrorKind::NoInfoConfigured,
            RegistryError::InfoFileNotFound { .. } => ErrorKind::InfoFileNotFound,
            _ => ErrorKind::ConfigError,
        }
    }
}

impl From<RegistryError> for ToolError {
    fn from(err: RegistryError) -> Self {
        ToolError::new(err.kind(), err.to_string())
    }
}

/// How the SSH client authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Private key file, already `~`-expanded.
    Key(PathBuf),
    /// Password handed to `sshpass` through the environment.
    Password(String),
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Key(_) => "key",
            Credential::Password(_) => "password",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Key(path) => f.debug_tuple("Key").field(path).finish(),
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// A validated connection definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub name: String,
    pub host: String,
    pub user: String,
    pub port: u16,
    pub credential: Credential,
    pub description: Option<String>,
    /// Resolved path of the markdown info file, if configured.
    pub info_file: Option<PathBuf>,
}

impl ConnectionDescriptor {
    /// Public view without credentials.
    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            name: self.name.clone(),
            host: self.host.clone(),
            user: self.user.clone(),
            port: self.port,
            description: self.description.clone(),
            auth: self.credential.kind().to_string(),
            info_available: self.info_file.is_some(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRegistry {
    #[serde(default)]
    connections: Option<BTreeMap<String, RawConnection>>,
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    host: Option<String>,
    user: Option<String>,
    port: Option<u64>,
    key_path: Option<String>,
    password: Option<String>,
    description: Option<String>,
    info_file: Option<String>,
}

/// Named connection definitions loaded from YAML.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<String, ConnectionDescriptor>,
}

impl ConnectionRegistry {
    /// Load and validate the registry file.
    pub fn load(path: &Path, info_dir: &Path) -> Result<Self, RegistryError> {
        let contents = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_yaml(&contents, info_dir)?;
        tracing::debug!(
            path = %path.display(),
            count = registry.connections.len(),
            "Loaded connection registry"
        );
        Ok(registry)
    }

    /// Parse and validate registry YAML.
    pub fn from_yaml(yaml: &str, info_dir: &Path) -> Result<Self, RegistryError> {
        let raw: Option<RawRegistry> = serde_yaml::from_str(yaml)?;
        let entries = raw
            .and_then(|r| r.connections)
            .filter(|c| !c.is_empty())
            .ok_or(RegistryError::Empty)?;

        let mut connections = BTreeMap::new();
        for (name, raw) in entries {
            let descriptor = validate_entry(name, raw, info_dir)?;
            connections.insert(descriptor.name.clone(), descriptor);
        }
        Ok(Self { connections })
    }

    /// Builds a registry from already-validated descriptors.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ConnectionDescriptor>) -> Self {
        Self {
            connections: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&ConnectionDescriptor, RegistryError> {
        self.connections
            .get(name)
            .ok_or_else(|| RegistryError::UnknownConnection {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    /// Connection names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    pub fn summaries(&self) -> Vec<ConnectionSummary> {
        self.connections.values().map(|d| d.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Whether any connection authenticates with a password.
    pub fn uses_password(&self) -> bool {
        self.connections
            .values()
            .any(|d| matches!(d.credential, Credential::Password(_)))
    }

    /// Read the markdown info file of a connection.
    pub async fn read_info(&self, name: &str) -> Result<String, RegistryError> {
        let descriptor = self.get(name)?;
        let path = descriptor
            .info_file
            .as_ref()
            .ok_or_else(|| RegistryError::NoInfoConfigured(name.to_string()))?;

        tokio::fs::read_to_string(path).await.map_err(|e| {
            tracing::debug!(connection = %name, path = %path.display(), error = %e, "Info file read failed");
            RegistryError::InfoFileNotFound {
                name: name.to_string(),
                path: path.clone(),
            }
        })
    }
}

fn valid_connection_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn required(
    name: &str,
    value: Option<String>,
    field: &'static str,
) -> Result<String, RegistryError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RegistryError::MissingField {
            name: name.to_string(),
            field,
        })
}

fn validate_entry(
    name: String,
    raw: RawConnection,
    info_dir: &Path,
) -> Result<ConnectionDescriptor, RegistryError> {
    if !valid_connection_name(&name) {
        return Err(RegistryError::InvalidName { name });
    }

    let host = required(&name, raw.host, "host")?;
    let user = required(&name, raw.user, "user")?;

    let port = raw.port.unwrap_or(22);
    if !(1..=65535).contains(&port) {
        return Err(RegistryError::InvalidPort { name, port });
    }

    let key_path = raw.key_path.filter(|k| !k.trim().is_empty());
    let password = raw.password.filter(|p| !p.is_empty());
    let credential = match (key_path, password) {
        (Some(key), None) => {
            let path = expand_tilde(key.trim());
            if fs::File::open(&path).is_err() {
                return Err(RegistryError::KeyNotReadable { name, path });
            }
            Credential::Key(path)
        }
        (None, Some(password)) => Credential::Password(password),
        _ => return Err(RegistryError::CredentialConflict { name }),
    };

    let info_file = raw
        .info_file
        .filter(|f| !f.trim().is_empty())
        .map(|f| {
            let path = expand_tilde(f.trim());
            if path.is_absolute() {
                path
            } else {
                info_dir.join(path)
            }
        });

    Ok(ConnectionDescriptor {
        name,
        host,
        user,
        port: port as u16,
        credential,
        description: raw.description.filter(|d| !d.trim().is_empty()),
        info_file,
    })
}
