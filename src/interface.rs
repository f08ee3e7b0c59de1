//! Device introspection
//!
//! The introspection is the set of interfaces the device declares. It is
//! loaded once at startup and never changes for the lifetime of a
//! [`crate::transport::Transport`]. Only the fields the transport needs are
//! read from interface files; mapping validation lives elsewhere.

use crate::protocol::topics::introspection_payload;
use crate::protocol::InterfaceType;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Which side publishes on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The device publishes.
    Producer,
    /// The server publishes, the device receives.
    Consumer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceMetadata {
    pub name: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub direction: Direction,
    pub interface_type: InterfaceType,
}

impl InterfaceMetadata {
    pub fn new(
        name: impl Into<String>,
        version_major: u32,
        version_minor: u32,
        direction: Direction,
        interface_type: InterfaceType,
    ) -> Self {
        Self {
            name: name.into(),
            version_major,
            version_minor,
            direction,
            interface_type,
        }
    }
}

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("Failed to read interface file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse interface file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Interface {0} declares neither ownership nor quality")]
    MissingDirection(String),
    #[error("Interface {0} declared more than once")]
    Duplicate(String),
}

/// On-disk interface document, reduced to what the transport reads.
#[derive(Debug, Deserialize)]
struct InterfaceDocument {
    #[serde(alias = "interface")]
    interface_name: String,
    version_major: u32,
    version_minor: u32,
    #[serde(rename = "type")]
    interface_type: DocumentType,
    ownership: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DocumentType {
    Datastream,
    Properties,
}

impl InterfaceDocument {
    fn into_metadata(self) -> Result<InterfaceMetadata, InterfaceError> {
        let direction = match (self.ownership.as_deref(), self.quality.as_deref()) {
            (Some("device"), _) | (None, Some("producer")) => Direction::Producer,
            (Some("server"), _) | (None, Some("consumer")) => Direction::Consumer,
            _ => return Err(InterfaceError::MissingDirection(self.interface_name)),
        };
        let interface_type = match self.interface_type {
            DocumentType::Datastream => InterfaceType::DataStream,
            DocumentType::Properties => InterfaceType::Properties,
        };

        Ok(InterfaceMetadata {
            name: self.interface_name,
            version_major: self.version_major,
            version_minor: self.version_minor,
            direction,
            interface_type,
        })
    }
}

/// Interfaces declared by the device, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Introspection {
    interfaces: BTreeMap<String, InterfaceMetadata>,
}

impl Introspection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, metadata: InterfaceMetadata) -> Self {
        self.interfaces.insert(metadata.name.clone(), metadata);
        self
    }

    /// Load every `*.json` file in `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, InterfaceError> {
        let io_error = |source| InterfaceError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = std::fs::read_dir(dir)
            .map_err(io_error)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();

        let mut introspection = Self::new();
        for path in paths {
            let content = std::fs::read_to_string(&path).map_err(|source| InterfaceError::Io {
                path: path.clone(),
                source,
            })?;
            let metadata = Self::parse(&content).map_err(|e| match e {
                ParseFailure::Json(source) => InterfaceError::Parse {
                    path: path.clone(),
                    source,
                },
                ParseFailure::Interface(e) => e,
            })?;

            if introspection.interfaces.contains_key(&metadata.name) {
                return Err(InterfaceError::Duplicate(metadata.name));
            }
            debug!(interface = %metadata.name, file = %path.display(), "Loaded interface");
            introspection = introspection.with(metadata);
        }

        Ok(introspection)
    }

    fn parse(content: &str) -> Result<InterfaceMetadata, ParseFailure> {
        let document: InterfaceDocument =
            serde_json::from_str(content).map_err(ParseFailure::Json)?;
        document.into_metadata().map_err(ParseFailure::Interface)
    }

    pub fn get(&self, name: &str) -> Option<&InterfaceMetadata> {
        self.interfaces.get(name)
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InterfaceMetadata> {
        self.interfaces.values()
    }

    pub fn consumers(&self) -> impl Iterator<Item = &InterfaceMetadata> {
        self.iter()
            .filter(|metadata| metadata.direction == Direction::Consumer)
    }

    /// `name:major:minor;...` in name order.
    pub fn payload(&self) -> String {
        introspection_payload(
            self.iter()
                .map(|m| (m.name.as_str(), m.version_major, m.version_minor)),
        )
    }
}

enum ParseFailure {
    Json(serde_json::Error),
    Interface(InterfaceError),
}
