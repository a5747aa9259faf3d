//! App Container Image manifest schema.
//!
//! The subset of the appc image manifest the conversion emits and consumes:
//! the manifest itself, its label/annotation/dependency records, and the
//! optional app section. Field names follow the appc JSON wire format
//! (`acKind`, `acVersion`, `pathWhitelist`, ...).
//!
//! Also home to the AC identifier / AC name sanitizers used for manifest
//! names, port names, and mount-point names.

use serde::{Deserialize, Serialize};

use crate::error::{ConversionError, Result};

/// The appc schema version stamped into every manifest.
pub const AC_VERSION: &str = "0.7.0";

/// The `acKind` value of an image manifest.
pub const IMAGE_MANIFEST_KIND: &str = "ImageManifest";

/// Annotation key carrying the Docker repository name.
pub const ANNOTATION_REPOSITORY: &str = "appc.io/docker/repository";

/// Annotation key carrying the Docker layer id.
pub const ANNOTATION_IMAGE_ID: &str = "appc.io/docker/imageid";

/// Annotation key carrying the Docker parent layer id.
pub const ANNOTATION_PARENT_IMAGE_ID: &str = "appc.io/docker/parentimageid";

/// Annotation key carrying the Docker tag.
pub const ANNOTATION_TAG: &str = "appc.io/docker/tag";

/// An ACI image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Always [`IMAGE_MANIFEST_KIND`].
    #[serde(rename = "acKind")]
    pub ac_kind: String,

    /// Always [`AC_VERSION`].
    #[serde(rename = "acVersion")]
    pub ac_version: String,

    /// Sanitized AC identifier naming the image.
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<App>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,

    /// Absolute paths this layer contributes to the rendered image. Empty on
    /// the squashed manifest.
    #[serde(
        default,
        rename = "pathWhitelist",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub path_whitelist: Vec<String>,
}

impl ImageManifest {
    /// A manifest with the fixed kind/version fields filled in.
    pub fn new(name: String) -> Self {
        ImageManifest {
            ac_kind: IMAGE_MANIFEST_KIND.to_string(),
            ac_version: AC_VERSION.to_string(),
            name,
            labels: Vec::new(),
            app: None,
            annotations: Vec::new(),
            dependencies: Vec::new(),
            path_whitelist: Vec::new(),
        }
    }

    /// Value of the label `name`, if present.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Value of the annotation `name`, if present.
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotations
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }
}

/// A named label on a manifest or dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: &str, value: &str) -> Self {
        Label {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// A named annotation on a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}

impl Annotation {
    pub fn new(name: &str, value: &str) -> Self {
        Annotation {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// The runnable app section of a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    /// Command line; the first element must be an absolute path.
    pub exec: Vec<String>,

    /// User the app runs as.
    pub user: String,

    /// Group the app runs as.
    pub group: String,

    #[serde(
        default,
        rename = "workingDirectory",
        skip_serializing_if = "String::is_empty"
    )]
    pub working_directory: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<EnvironmentVariable>,

    #[serde(default, rename = "mountPoints", skip_serializing_if = "Vec::is_empty")]
    pub mount_points: Vec<MountPoint>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
}

/// One environment variable of an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

/// A mount point derived from a Docker volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountPoint {
    /// Sanitized AC name, unique within the app.
    pub name: String,
    /// Absolute path of the volume inside the rootfs.
    pub path: String,
}

/// A network port exposed by the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    /// Sanitized AC name of the original port spec.
    pub name: String,
    pub protocol: String,
    pub port: u32,
}

/// A dependency on another image, resolved by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(rename = "imageName")]
    pub image_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

/// Characters allowed as separators inside an AC identifier, but not at its
/// edges.
const IDENTIFIER_SEPARATORS: &[char] = &['-', '.', '_', '~', '/'];

/// Sanitize a string into a valid AC identifier.
///
/// Lowercases the input, replaces every character outside
/// `[a-z0-9-._~/]` with `_`, and strips separator characters from both
/// edges. Fails if nothing valid remains.
pub fn sanitize_ac_identifier(s: &str) -> Result<String> {
    let replaced: String = s
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || IDENTIFIER_SEPARATORS.contains(&c) {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = replaced.trim_matches(|c: char| IDENTIFIER_SEPARATORS.contains(&c));
    if trimmed.is_empty() {
        return Err(ConversionError::InvalidName(s.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Sanitize a string into a valid AC name.
///
/// Lowercases the input, replaces every character outside `[a-z0-9-]` with
/// `-`, and strips hyphens from both edges. Fails if nothing valid remains.
pub fn sanitize_ac_name(s: &str) -> Result<String> {
    let replaced: String = s
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = replaced.trim_matches('-');
    if trimmed.is_empty() {
        return Err(ConversionError::InvalidName(s.to_string()));
    }
    Ok(trimmed.to_string())
}
