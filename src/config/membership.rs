use crate::replica::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One entry of the membership file. Fields other than these are accepted and ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: NodeId,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl MemberConfig {
    pub fn with_address(id: u64, host: impl Into<String>, port: u16) -> Self {
        MemberConfig {
            id: NodeId::new(id),
            host: Some(host.into()),
            port: Some(port),
        }
    }

    /// A member whose address has to be resolved through the hub.
    pub fn without_address(id: u64) -> Self {
        MemberConfig {
            id: NodeId::new(id),
            host: None,
            port: None,
        }
    }

    /// `host:port`, when both are configured.
    pub fn address(&self) -> Option<String> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
            _ => None,
        }
    }
}

/// ClusterMembership is the static set of nodes, loaded once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterMembership {
    members: Vec<MemberConfig>,
}

impl ClusterMembership {
    pub fn new(members: Vec<MemberConfig>) -> Self {
        ClusterMembership { members }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = read(path)?;
        let members: Vec<MemberConfig> = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let membership = ClusterMembership { members };
        membership.validate()?;
        Ok(membership)
    }

    pub fn members(&self) -> &[MemberConfig] {
        &self.members
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.members.is_empty() {
            return Err(ConfigError::Invalid("membership is empty".into()));
        }

        let mut seen = HashSet::with_capacity(self.members.len());
        for member in self.members.iter() {
            if !seen.insert(member.id) {
                return Err(ConfigError::Invalid(format!("duplicate node id {}", member.id)));
            }
            if member.host.is_some() != member.port.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "node {} must have both host and port, or neither",
                    member.id
                )));
            }
        }

        Ok(())
    }
}

/// Where the discovery hub listens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HubConfigFile {
    Single(HubConfig),
    List(Vec<HubConfig>),
}

impl HubConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = read(path)?;
        let file: HubConfigFile = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        match file {
            HubConfigFile::Single(hub) => Ok(hub),
            HubConfigFile::List(mut hubs) => {
                if hubs.len() != 1 {
                    return Err(ConfigError::Invalid(format!(
                        "expected exactly one hub in {:?}, found {}",
                        path,
                        hubs.len()
                    )));
                }
                Ok(hubs.remove(0))
            }
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
