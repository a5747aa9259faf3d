//! Rendered-image computation.
//!
//! Given the per-layer ACIs ordered from application layer down to base,
//! the renderer determines, for each layer, the set of entries that
//! survive into the squashed image: its `FileMap`. A lower layer's file
//! survives only if the uppermost path whitelist still lists it and no
//! upper layer already provided or deleted the path.
//!
//! The squasher consumes only the per-layer file maps and the order they
//! were computed in.

use std::collections::{HashMap, HashSet};

use tar::Archive;

use crate::error::{ConversionError, Result};
use crate::schema::ImageManifest;
use crate::store::ConversionStore;
use crate::tar_walk::{clean_name, entry_name, parent_dir, walk};

/// One per-layer ACI in rendering order, upper first.
#[derive(Debug, Clone)]
pub struct Image {
    /// The layer's synthesized manifest.
    pub manifest: ImageManifest,
    /// Conversion-store key of the layer's ACI.
    pub key: String,
    /// Depth in the dependency chain; 0 is the application layer.
    pub level: u16,
}

/// A layer's contribution to the squashed image.
#[derive(Debug)]
pub struct RenderedLayer {
    /// Conversion-store key of the layer's ACI.
    pub key: String,
    /// Cleaned entry names (`rootfs/...`) that survive to the output.
    pub file_map: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EntryKind {
    Directory,
    Other,
}

/// Compute the per-layer file maps for `images`, ordered upper to base.
pub fn render_image_list(
    images: &[Image],
    store: &ConversionStore,
) -> Result<Vec<RenderedLayer>> {
    if images.is_empty() {
        return Err(ConversionError::EmptyImageList);
    }

    let mut all_files: HashMap<String, EntryKind> = HashMap::new();
    let mut rendered = Vec::with_capacity(images.len());

    for (position, image) in images.iter().enumerate() {
        let upper_pwl = upper_whitelist(images, position);
        let layer = layer_files(image, store, &mut all_files, upper_pwl.as_ref())?;
        rendered.push(layer);
    }

    Ok(rendered)
}

/// Path whitelist of the uppermost layer above `position` that carries one,
/// mapped into `rootfs/`-prefixed entry names.
fn upper_whitelist(images: &[Image], position: usize) -> Option<HashSet<String>> {
    images[..position]
        .iter()
        .find(|image| !image.manifest.path_whitelist.is_empty())
        .map(|image| whitelist_to_entries(&image.manifest.path_whitelist))
}

fn whitelist_to_entries(pwl: &[String]) -> HashSet<String> {
    pwl.iter()
        .map(|path| clean_name(&format!("rootfs/{path}")))
        .collect()
}

fn layer_files(
    image: &Image,
    store: &ConversionStore,
    all_files: &mut HashMap<String, EntryKind>,
    upper_pwl: Option<&HashSet<String>>,
) -> Result<RenderedLayer> {
    let own_pwl = whitelist_to_entries(&image.manifest.path_whitelist);
    let mut file_map = HashSet::new();

    let mut archive = Archive::new(store.read_stream(&image.key)?);
    walk(&mut archive, |entry| {
        let name = clean_name(&entry_name(entry)?);
        let is_dir = entry.header().entry_type().is_dir();

        if name == "rootfs" && is_dir {
            file_map.insert(name.clone());
            all_files.insert(name, EntryKind::Directory);
            return Ok(());
        }
        // Everything outside rootfs/ (the manifest) is not part of the
        // rendered tree.
        if !name.starts_with("rootfs/") {
            return Ok(());
        }

        // A whiteout deletes the unprefixed sibling path for all lower
        // layers.
        let base = basename(&name);
        if let Some(deleted) = base.strip_prefix(".wh.") {
            let deleted = format!("{}/{}", parent_dir(&name), deleted);
            all_files.entry(deleted).or_insert(EntryKind::Other);
            return Ok(());
        }

        // Only whitelisted entries are part of a layer.
        if !own_pwl.is_empty() && !own_pwl.contains(&name) {
            return Ok(());
        }
        // An upper whitelist constrains what lower layers contribute.
        if let Some(upper) = upper_pwl {
            if !upper.contains(&name) {
                return Ok(());
            }
        }

        // Overridden or deleted by an upper layer.
        if all_files.contains_key(&name) {
            return Ok(());
        }
        let mut ancestor = parent_dir(&name);
        while ancestor != "." && ancestor != "/" && !ancestor.is_empty() {
            if let Some(kind) = all_files.get(ancestor) {
                if *kind != EntryKind::Directory {
                    return Ok(());
                }
            }
            ancestor = parent_dir(ancestor);
        }

        file_map.insert(name.clone());
        all_files.insert(
            name,
            if is_dir {
                EntryKind::Directory
            } else {
                EntryKind::Other
            },
        );
        Ok(())
    })?;

    Ok(RenderedLayer {
        key: image.key.clone(),
        file_map,
    })
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upper_whitelist_picks_uppermost() {
        let mut upper = ImageManifest::new("app-a".to_string());
        upper.path_whitelist = vec!["/etc/a".to_string()];
        let mut middle = ImageManifest::new("app-b".to_string());
        middle.path_whitelist = vec!["/etc/b".to_string()];

        let images = vec![
            Image {
                manifest: upper,
                key: "k0".to_string(),
                level: 0,
            },
            Image {
                manifest: middle,
                key: "k1".to_string(),
                level: 1,
            },
            Image {
                manifest: ImageManifest::new("app-c".to_string()),
                key: "k2".to_string(),
                level: 2,
            },
        ];

        assert!(upper_whitelist(&images, 0).is_none());
        let from_top = upper_whitelist(&images, 2).unwrap();
        assert!(from_top.contains("rootfs/etc/a"));
        assert!(!from_top.contains("rootfs/etc/b"));
    }

    #[test]
    fn test_whitelist_to_entries_prefixes_rootfs() {
        let entries = whitelist_to_entries(&["/etc/a".to_string(), "/dev/fd".to_string()]);
        assert!(entries.contains("rootfs/etc/a"));
        assert!(entries.contains("rootfs/dev/fd"));
    }

    #[test]
    fn test_render_empty_list_fails() {
        let store = ConversionStore::new();
        assert!(matches!(
            render_image_list(&[], &store).unwrap_err(),
            ConversionError::EmptyImageList
        ));
    }
}
