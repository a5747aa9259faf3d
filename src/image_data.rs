//! Docker v1 layer metadata as stored in a `docker save` archive.
//!
//! Each layer directory in the saved tarball carries a `json` file with the
//! layer's image metadata. Only the fields the conversion consumes are
//! modeled; unknown fields are ignored on deserialization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Metadata of one Docker layer, deserialized from `<id>/json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerImageData {
    /// Hex id of the layer.
    #[serde(default)]
    pub id: String,

    /// Hex id of the parent layer; empty for the base of the chain.
    #[serde(default)]
    pub parent: String,

    /// Free-form comment recorded at build time.
    #[serde(default)]
    pub comment: String,

    /// Creation timestamp; absent or the Unix epoch means "unset".
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,

    /// Author of the layer.
    #[serde(default)]
    pub author: String,

    /// Runtime configuration; only present on layers that set one.
    #[serde(default)]
    pub config: Option<DockerImageConfig>,

    /// Target architecture (e.g. `amd64`).
    #[serde(default)]
    pub architecture: String,

    /// Target operating system (e.g. `linux`).
    #[serde(default)]
    pub os: String,
}

impl DockerImageData {
    /// Creation time, if it is set to something other than the Unix epoch.
    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.created
            .filter(|created| *created != DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Runtime configuration of a Docker layer (the `config` object).
///
/// Docker serializes unset collections as JSON `null`, hence the pervasive
/// `Option` wrapping. Maps are ordered so that derived manifest fields come
/// out deterministic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerImageConfig {
    /// `"user"` or `"user:group"`; empty means root.
    #[serde(default, rename = "User")]
    pub user: String,

    /// Environment entries of the form `KEY=VALUE`.
    #[serde(default, rename = "Env")]
    pub env: Option<Vec<String>>,

    /// Default command arguments.
    #[serde(default, rename = "Cmd")]
    pub cmd: Option<Vec<String>>,

    /// Entry point; prepended to `cmd` when building the exec line.
    #[serde(default, rename = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,

    /// Working directory for the app.
    #[serde(default, rename = "WorkingDir")]
    pub working_dir: String,

    /// Volume paths (the map values carry no information).
    #[serde(default, rename = "Volumes")]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,

    /// Exposed ports keyed by `port[/proto]` spec.
    #[serde(default, rename = "ExposedPorts")]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,

    /// Older port list form; consulted only when `exposed_ports` is absent.
    #[serde(default, rename = "PortSpecs")]
    pub port_specs: Option<Vec<String>>,
}
