#![forbid(unsafe_code)]
//! Convert saved Docker images into App Container Images.
//!
//! This library takes a tar archive as produced by `docker save` and turns
//! it into a single squashed ACI: one `manifest`, one `rootfs/`, with all
//! Docker layers folded together.
//!
//! # Overview
//!
//! The conversion is a batch pipeline over temp files:
//!
//! 1. Resolve the image id from the archive's `repositories` index and
//!    follow `parent` links to recover the layer ancestry, child first.
//! 2. Rewrite each Docker layer, base first, into an intermediate ACI with
//!    a synthesized manifest. The manifest's path whitelist accumulates
//!    bottom-up: each layer inherits the whitelist below it, adds its own
//!    files, and subtracts its whiteouts.
//! 3. Register the intermediate ACIs in an in-memory, content-addressed
//!    store.
//! 4. Render the layers upper-to-base to find each layer's surviving
//!    files, then squash them into one output tar, resolving hard links
//!    whose targets were dropped.
//! 5. Validate the result and atomically rename it into place.
//!
//! Intermediate ACIs live in a temp directory that is removed when the
//! conversion ends, successfully or not; only the squashed ACI is
//! promoted to the output directory.
//!
//! # Example
//!
//! ```no_run
//! let (aci_path, manifest) = docker2aci::convert(std::path::Path::new("alpine.tar"))?;
//! println!("wrote {} ({})", aci_path.display(), manifest.name);
//! # Ok::<(), docker2aci::ConversionError>(())
//! ```

pub mod aci;
pub mod builder;
pub mod docker_archive;
pub mod error;
pub mod image_data;
pub mod render;
pub mod schema;
pub mod squash;
pub mod store;
pub mod tar_walk;

use std::path::{Path, PathBuf};

pub use docker_archive::DockerArchive;
pub use error::{ConversionError, Result};
pub use image_data::{DockerImageConfig, DockerImageData};
pub use render::Image;
pub use schema::ImageManifest;
pub use store::ConversionStore;

/// Convert the Docker archive at `docker_archive` into a squashed ACI
/// under `output_dir`, using `tmp_dir` for intermediate files.
///
/// Returns the path of the written `.aci`.
pub fn convert_file(docker_archive: &Path, output_dir: &Path, tmp_dir: &Path) -> Result<PathBuf> {
    let mut archive = DockerArchive::open(docker_archive)?;

    let (image_id, app_name) = archive.resolve_image()?;
    let ancestry = archive.ancestry(&image_id)?;
    tracing::debug!(app = %app_name, layers = ancestry.len(), "resolved ancestry");

    let layers_dir = tempfile::Builder::new()
        .prefix("docker2aci-")
        .tempdir_in(tmp_dir)?;

    let mut store = ConversionStore::new();
    let mut images = Vec::with_capacity(ancestry.len());
    let mut cur_pwl: Vec<String> = Vec::new();

    // Ancestry is child first; layers are built base first so each can
    // inherit the path whitelist of the layer below it.
    for index in (0..ancestry.len()).rev() {
        let layer_id = &ancestry[index];
        let (aci_path, manifest) = builder::build_aci(
            &mut archive,
            &app_name,
            index,
            layer_id,
            layers_dir.path(),
            tmp_dir,
            cur_pwl,
        )
        .map_err(|err| err.in_layer(layer_id))?;

        let key = store
            .write_aci(&aci_path)
            .map_err(|err| err.in_layer(layer_id))?;

        cur_pwl = manifest.path_whitelist.clone();
        images.push(Image {
            manifest,
            key,
            level: index as u16,
        });
    }

    // The renderer expects images ordered from the application layer down
    // to the base.
    images.reverse();

    squash::squash_layers(&images, &store, &app_name, output_dir)
}

/// Convert the Docker archive at `docker_archive` into a squashed ACI in
/// the current working directory, using the system temp directory for
/// intermediates.
///
/// Returns the absolute output path and the manifest read back from the
/// written image.
pub fn convert(docker_archive: &Path) -> Result<(PathBuf, ImageManifest)> {
    let aci_path = convert_file(docker_archive, Path::new("."), &std::env::temp_dir())?;
    let manifest = aci::manifest_from_image(&aci_path)?;
    let aci_path = std::path::absolute(&aci_path)?;
    Ok((aci_path, manifest))
}
