//! Reading `docker save` archives.
//!
//! A saved Docker image is a tar archive containing a top-level
//! `repositories` JSON index plus one directory per layer, each holding the
//! layer's `json` metadata and its `layer.tar` payload. The archive is
//! scanned from offset zero for every lookup, so the backing handle must be
//! seekable; entries are always visited in archive order.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tar::Archive;

use crate::error::{ConversionError, Result};
use crate::image_data::DockerImageData;
use crate::tar_walk::{clean_name, entry_name};

/// The tag preferred when the `repositories` index offers several.
const DEFAULT_TAG: &str = "latest";

/// `repositories` index layout: app name -> tag -> layer id.
type RepositoryIndex = HashMap<String, HashMap<String, String>>;

/// A seekable handle on a saved Docker image archive.
#[derive(Debug)]
pub struct DockerArchive {
    file: File,
}

impl DockerArchive {
    /// Wrap an already-open archive file.
    pub fn new(file: File) -> Self {
        DockerArchive { file }
    }

    /// Open the archive at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(DockerArchive::new(File::open(path)?))
    }

    /// Resolve the image to convert from the `repositories` index.
    ///
    /// Exactly one app must be present; with several the caller has to
    /// disambiguate and the error lists the candidates. The `latest` tag is
    /// preferred; a single other tag is adopted, anything else fails.
    /// Returns `(layer id, app name)`.
    pub fn resolve_image(&mut self) -> Result<(String, String)> {
        let bytes = self
            .file_bytes("repositories")
            .map_err(|err| match err {
                ConversionError::EntryNotFound(_) => ConversionError::RepositoriesNotFound,
                other => other,
            })?;
        let index: RepositoryIndex = serde_json::from_slice(&bytes)?;

        let app_name = match index.len() {
            0 => return Err(ConversionError::NoImages),
            1 => index.keys().next().cloned().unwrap_or_default(),
            _ => {
                let mut names: Vec<String> = index.keys().cloned().collect();
                names.sort();
                return Err(ConversionError::MultipleImages(names));
            }
        };

        let tags = &index[&app_name];
        let tag = if tags.contains_key(DEFAULT_TAG) {
            DEFAULT_TAG.to_string()
        } else if tags.len() == 1 {
            tags.keys().next().cloned().unwrap_or_default()
        } else {
            return Err(ConversionError::TagNotFound(DEFAULT_TAG.to_string()));
        };

        let image_id = tags[&tag].clone();
        tracing::debug!(app = %app_name, tag = %tag, id = %image_id, "resolved image");
        Ok((image_id, app_name))
    }

    /// Follow `parent` links from `image_id` down to the base layer.
    ///
    /// The returned chain is ordered child first; a repeated id is a fatal
    /// inconsistency.
    pub fn ancestry(&mut self, image_id: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = image_id.to_string();

        while !current.is_empty() {
            if !seen.insert(current.clone()) {
                return Err(ConversionError::AncestryCycle(current));
            }
            let data = self.layer_data(&current)?;
            chain.push(current);
            current = data.parent;
        }

        Ok(chain)
    }

    /// Read and deserialize `<id>/json`.
    pub fn layer_data(&mut self, layer_id: &str) -> Result<DockerImageData> {
        let bytes = self.layer_json(layer_id)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read `<id>/json` as raw bytes.
    pub fn layer_json(&mut self, layer_id: &str) -> Result<Vec<u8>> {
        self.file_bytes(&format!("{layer_id}/json"))
    }

    /// Copy `<id>/layer.tar` to `dest` and return a handle positioned at the
    /// start of the copy.
    pub fn extract_layer(&mut self, layer_id: &str, dest: &Path) -> Result<File> {
        let wanted = format!("{layer_id}/layer.tar");
        self.rewind()?;

        let mut archive = Archive::new(&mut self.file);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if clean_name(&entry_name(&entry)?) != wanted {
                continue;
            }
            // Opened read-write: the copy is handed back for reading.
            let mut out = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(dest)?;
            io::copy(&mut entry, &mut out)?;
            out.seek(SeekFrom::Start(0))?;
            return Ok(out);
        }

        Err(ConversionError::EntryNotFound(wanted))
    }

    /// Read the contents of the entry whose cleaned name equals `wanted`.
    fn file_bytes(&mut self, wanted: &str) -> Result<Vec<u8>> {
        self.rewind()?;

        let mut archive = Archive::new(&mut self.file);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if clean_name(&entry_name(&entry)?) != wanted {
                continue;
            }
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(bytes);
        }

        Err(ConversionError::EntryNotFound(wanted.to_string()))
    }

    fn rewind(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}
