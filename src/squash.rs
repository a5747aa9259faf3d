//! Squashing ordered per-layer ACIs into one output ACI.
//!
//! The squashed image carries a single merged manifest and a single
//! `rootfs/` holding every surviving entry from the rendered layers. The
//! output is written to a temp file in the output directory, validated,
//! and only then renamed into place, so a failed run never leaves a
//! partial `.aci` behind.
//!
//! # Hard links
//!
//! A tar writer is append-only and a hard link can only point at an entry
//! that was already emitted. When rendering drops the file that holds the
//! content but keeps links to it, the content has to be emitted under the
//! first link's name instead. That fact is only discoverable by scanning
//! the whole layer first, hence the two passes: pass one indexes every
//! kept hard link per layer, pass two emits entries, promoting content
//! into the first link's name and rewriting the remaining links to point
//! there.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tar::{Archive, Builder, EntryType, Header};

use crate::aci;
use crate::error::{ConversionError, Result};
use crate::render::{self, Image, RenderedLayer};
use crate::schema::ImageManifest;
use crate::store::ConversionStore;
use crate::tar_walk::{append_entry, clean_name, entry_link_name, entry_name, walk};

/// Squash `images` (ordered upper to base) into `<app name>.aci` under
/// `output_dir`, returning the written path.
pub fn squash_layers(
    images: &[Image],
    store: &ConversionStore,
    app_name: &str,
    output_dir: &Path,
) -> Result<PathBuf> {
    let rendered = render::render_image_list(images, store)?;

    let mut manifests = Vec::with_capacity(rendered.len());
    for layer in &rendered {
        manifests.push(store.image_manifest(&layer.key)?.clone());
    }

    let mut temp = tempfile::Builder::new()
        .prefix("docker2aci-squashed-")
        .tempfile_in(output_dir)?;

    write_squashed_image(&mut temp, &rendered, store, &manifests)?;
    temp.flush()?;

    aci::validate_aci(temp.path())?;

    let squashed_path = output_dir.join(squashed_file_name(app_name));
    temp.persist(&squashed_path)
        .map_err(|err| ConversionError::Io(err.error))?;

    tracing::debug!(path = %squashed_path.display(), "wrote squashed ACI");
    Ok(squashed_path)
}

fn squashed_file_name(app_name: &str) -> String {
    format!("{}.aci", app_name.replace('/', "-"))
}

/// Per-target record of the first kept hard link pointing at it.
#[derive(Debug)]
struct HardLinkEntry {
    first_link_name: String,
    first_link_header: Header,
    keep_original: bool,
    walked: bool,
}

fn write_squashed_image<W: Write>(
    out: W,
    rendered: &[RenderedLayer],
    store: &ConversionStore,
    manifests: &[ImageManifest],
) -> Result<()> {
    let mut builder = Builder::new(out);

    let final_manifest = merge_manifests(manifests);
    aci::write_manifest(&mut builder, &final_manifest)?;
    aci::write_rootfs_dir(&mut builder)?;

    // layer key -> link target -> first kept link; first seen wins.
    let mut hard_links: HashMap<String, HashMap<String, HardLinkEntry>> = HashMap::new();

    // Pass one: index every kept hard link without writing anything.
    for layer in rendered {
        let table = hard_links.entry(layer.key.clone()).or_default();
        let mut archive = Archive::new(store.read_stream(&layer.key)?);
        walk(&mut archive, |entry| {
            let name = clean_name(&entry_name(entry)?);
            if name == "manifest" || name == "rootfs" {
                return Ok(());
            }
            if layer.file_map.contains(&name)
                && entry.header().entry_type() == EntryType::Link
            {
                let target = clean_name(&entry_link_name(entry)?.unwrap_or_default());
                if !table.contains_key(&target) {
                    let keep_original = layer.file_map.contains(&target);
                    table.insert(
                        target,
                        HardLinkEntry {
                            first_link_name: name,
                            first_link_header: entry.header().clone(),
                            keep_original,
                            walked: false,
                        },
                    );
                }
            }
            Ok(())
        })?;
    }

    // Pass two: emit.
    for layer in rendered {
        let table = hard_links.entry(layer.key.clone()).or_default();
        let mut archive = Archive::new(store.read_stream(&layer.key)?);
        walk(&mut archive, |entry| {
            let name = clean_name(&entry_name(entry)?);
            // The squashed manifest and rootfs were added up front.
            if name == "manifest" || name == "rootfs" {
                return Ok(());
            }
            let keep = layer.file_map.contains(&name);

            if let Some(link) = table.get(&name) {
                // This entry is the target of a kept hard link.
                if keep != link.keep_original {
                    return Err(ConversionError::HardLinkConflict(name));
                }
                if keep {
                    let header = entry.header().clone();
                    let target = entry_link_name(entry)?;
                    append_entry(&mut builder, header, &name, target.as_deref(), entry)?;
                } else {
                    // The file itself is dropped but a hard link points at
                    // it: emit the content under the first link's name.
                    let mut header = link.first_link_header.clone();
                    header.set_entry_type(entry.header().entry_type());
                    header.set_size(entry.size());
                    header.as_old_mut().linkname = [0u8; 100];
                    let promoted_name = link.first_link_name.clone();
                    append_entry(&mut builder, header, &promoted_name, None, entry)?;
                }
            } else if keep {
                let mut already_written = false;
                let mut link_target = entry_link_name(entry)?;

                if entry.header().entry_type() == EntryType::Link {
                    let target = clean_name(link_target.as_deref().unwrap_or_default());
                    if let Some(link) = table.get_mut(&target) {
                        if !link.keep_original {
                            if link.walked {
                                // The content now lives under the first
                                // link's name.
                                link_target = Some(link.first_link_name.clone());
                            } else {
                                // This is the first link: its content was
                                // already emitted under this very name.
                                already_written = true;
                            }
                        }
                        link.walked = true;
                    }
                }

                if !already_written {
                    let header = entry.header().clone();
                    append_entry(&mut builder, header, &name, link_target.as_deref(), entry)?;
                }
            }
            Ok(())
        })?;
    }

    builder.into_inner()?;
    Ok(())
}

/// Merge the rendered layers' manifests into the squashed manifest.
///
/// The application layer's manifest wins; squashing subsumes its
/// dependencies, its `layer` label, its path whitelist, and the
/// `-<layerid>` suffix on its name.
fn merge_manifests(manifests: &[ImageManifest]) -> ImageManifest {
    let mut manifest = manifests[0].clone();

    manifest.dependencies.clear();
    manifest.labels.retain(|label| label.name != "layer");
    if let Some(idx) = manifest.name.rfind('-') {
        manifest.name.truncate(idx);
    }
    manifest.path_whitelist.clear();

    manifest
}
