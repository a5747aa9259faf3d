//! Error types for the docker2aci library.
//!
//! All fallible operations return a [`Result<T>`] which is an alias for
//! `Result<T, ConversionError>`. Errors are propagated upward with context
//! about which layer and which file they occurred in; the only swallowed
//! failure in the whole pipeline is a layer payload that cannot be opened
//! as an archive, which is treated as an empty layer (see
//! [`crate::builder`]).
//!
//! # Error Categories
//!
//! - **Input format**: [`RepositoriesNotFound`], [`NoImages`],
//!   [`MultipleImages`], [`TagNotFound`], [`EntryNotFound`],
//!   [`DevNotDirectory`], [`UnknownArchiveFormat`]
//! - **Ancestry**: [`AncestryCycle`]
//! - **Manifest synthesis**: [`InvalidName`], [`InvalidPort`]
//! - **ACI validation**: [`MissingManifest`], [`MissingRootfs`],
//!   [`InvalidArchive`]
//! - **Store lookups**: [`KeyNotFound`], [`NameNotFound`]
//! - **Logic invariants**: [`HardLinkConflict`]
//! - **System errors**: [`Io`], [`Json`]
//!
//! [`RepositoriesNotFound`]: ConversionError::RepositoriesNotFound
//! [`NoImages`]: ConversionError::NoImages
//! [`MultipleImages`]: ConversionError::MultipleImages
//! [`TagNotFound`]: ConversionError::TagNotFound
//! [`EntryNotFound`]: ConversionError::EntryNotFound
//! [`DevNotDirectory`]: ConversionError::DevNotDirectory
//! [`UnknownArchiveFormat`]: ConversionError::UnknownArchiveFormat
//! [`AncestryCycle`]: ConversionError::AncestryCycle
//! [`InvalidName`]: ConversionError::InvalidName
//! [`InvalidPort`]: ConversionError::InvalidPort
//! [`MissingManifest`]: ConversionError::MissingManifest
//! [`MissingRootfs`]: ConversionError::MissingRootfs
//! [`InvalidArchive`]: ConversionError::InvalidArchive
//! [`KeyNotFound`]: ConversionError::KeyNotFound
//! [`NameNotFound`]: ConversionError::NameNotFound
//! [`HardLinkConflict`]: ConversionError::HardLinkConflict
//! [`Io`]: ConversionError::Io
//! [`Json`]: ConversionError::Json

/// Result type alias for operations that may return a ConversionError.
pub type Result<T> = std::result::Result<T, ConversionError>;

/// Error types for Docker-to-ACI conversion.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    /// The `repositories` index file was not found in the input archive.
    #[error("repositories file not found")]
    RepositoriesNotFound,

    /// The `repositories` index names no images.
    #[error("no images found")]
    NoImages,

    /// The `repositories` index names more than one image; the caller must
    /// disambiguate.
    #[error("several images found, choose one of:\n\n{}", .0.join("\n"))]
    MultipleImages(Vec<String>),

    /// Neither `latest` nor a single unambiguous tag was found for the image.
    #[error("tag {0:?} not found")]
    TagNotFound(String),

    /// A required entry (`<id>/json`, `<id>/layer.tar`, ...) is missing from
    /// the input archive.
    #[error("file {0:?} not found in archive")]
    EntryNotFound(String),

    /// Following `parent` links revisited an already-seen layer id.
    #[error("cyclic layer ancestry at {0}")]
    AncestryCycle(String),

    /// A layer contains a non-directory entry at `/dev`.
    #[error(r#"invalid layer: "/dev" is not a directory"#)]
    DevNotDirectory,

    /// The byte stream is neither gzip nor tar.
    #[error("unrecognized archive format")]
    UnknownArchiveFormat,

    /// Sanitizing a string left no valid AC identifier characters.
    #[error("{0:?} contains no valid AC name characters")]
    InvalidName(String),

    /// A Docker port specification could not be parsed.
    #[error("error parsing port {0:?}")]
    InvalidPort(String),

    /// The ACI has no `manifest` entry.
    #[error("no manifest found in ACI")]
    MissingManifest,

    /// The ACI has no `rootfs` directory entry.
    #[error("no rootfs directory found in ACI")]
    MissingRootfs,

    /// The ACI archive violates the archive contract.
    #[error("invalid ACI: {0}")]
    InvalidArchive(String),

    /// No ACI with the given key exists in the conversion store.
    #[error("aci with key {0} not found")]
    KeyNotFound(String),

    /// No ACI with the given manifest name exists in the conversion store.
    #[error("no aci found with name {0:?}")]
    NameNotFound(String),

    /// The squasher's hard-link table disagrees with the rendered file map.
    #[error("hard link logic error: should we keep file {0:?}?")]
    HardLinkConflict(String),

    /// The renderer was handed an empty image list.
    #[error("image list empty")]
    EmptyImageList,

    /// Conversion of a single layer failed.
    #[error("error converting layer {id}: {source}")]
    Layer {
        /// Docker hex id of the failing layer.
        id: String,
        /// The underlying failure.
        #[source]
        source: Box<ConversionError>,
    },

    /// I/O error occurred during file or archive operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error occurred.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConversionError {
    /// Wrap an error with the id of the layer it occurred in.
    pub fn in_layer(self, id: &str) -> Self {
        ConversionError::Layer {
            id: id.to_string(),
            source: Box::new(self),
        }
    }
}
