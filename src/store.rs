//! In-memory registry of converted per-layer ACIs.
//!
//! The store keys each ACI by the hex-encoded SHA-512 of its decompressed
//! byte stream, prefixed with `sha512-`, and exposes exactly the lookups
//! the renderer needs: manifest by key, content stream by key, key by
//! manifest name. It is scoped to a single conversion run and never shared.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha512};

use crate::aci::{self, TarStream};
use crate::error::{ConversionError, Result};
use crate::schema::{ImageManifest, Label};

const HASH_PREFIX: &str = "sha512-";

#[derive(Debug)]
struct AciInfo {
    path: PathBuf,
    manifest: ImageManifest,
}

/// Content-addressed registry over the per-layer ACIs of one conversion.
#[derive(Debug, Default)]
pub struct ConversionStore {
    acis: HashMap<String, AciInfo>,
}

impl ConversionStore {
    pub fn new() -> Self {
        ConversionStore::default()
    }

    /// Register the ACI at `path`, returning its content key.
    ///
    /// The key hashes the decompressed stream, so a byte-identical ACI
    /// yields the same key no matter how it is stored on disk.
    pub fn write_aci(&mut self, path: &Path) -> Result<String> {
        let mut stream = aci::open_tar_file(path)?;
        let mut hasher = Sha512::new();
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let key = ConversionStore::hash_to_key(hasher);

        let manifest = aci::manifest_from_image(path)?;
        self.acis.insert(
            key.clone(),
            AciInfo {
                path: path.to_path_buf(),
                manifest,
            },
        );
        Ok(key)
    }

    /// Manifest of the ACI stored under `key`.
    pub fn image_manifest(&self, key: &str) -> Result<&ImageManifest> {
        self.acis
            .get(key)
            .map(|info| &info.manifest)
            .ok_or_else(|| ConversionError::KeyNotFound(key.to_string()))
    }

    /// Key of the first stored ACI whose manifest name matches.
    ///
    /// Labels are deliberately ignored: within a single conversion the name
    /// alone is unambiguous.
    pub fn get_aci(&self, name: &str, _labels: &[Label]) -> Result<String> {
        self.acis
            .iter()
            .find(|(_, info)| info.manifest.name == name)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| ConversionError::NameNotFound(name.to_string()))
    }

    /// Reopen the ACI stored under `key` as a fresh decompressed stream.
    /// The caller owns the returned reader.
    pub fn read_stream(&self, key: &str) -> Result<TarStream<File>> {
        let info = self
            .acis
            .get(key)
            .ok_or_else(|| ConversionError::KeyNotFound(key.to_string()))?;
        aci::open_tar_file(&info.path)
    }

    /// Keys are already fully resolved.
    pub fn resolve_key(&self, key: &str) -> Result<String> {
        Ok(key.to_string())
    }

    /// Format a finished hash as a store key.
    pub fn hash_to_key(hasher: Sha512) -> String {
        format!("{}{:x}", HASH_PREFIX, hasher.finalize())
    }
}
