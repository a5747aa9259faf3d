//! Per-layer ACI construction.
//!
//! Each Docker layer becomes one intermediate ACI: a synthesized manifest
//! plus the layer payload rewritten under `rootfs/`. The path whitelist is
//! accumulated bottom-up across layers; a layer inherits the whitelist of
//! the layer below it, adds its own files, and removes anything its
//! whiteouts delete.
//!
//! Layer payloads that cannot be opened as an archive are tolerated: some
//! `docker save` versions emit empty layers that are not valid tar files,
//! and those still produce a manifest-plus-empty-rootfs ACI.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use tar::{Archive, Builder, EntryType, Header};

use crate::aci;
use crate::docker_archive::DockerArchive;
use crate::error::{ConversionError, Result};
use crate::image_data::{DockerImageConfig, DockerImageData};
use crate::schema::{
    ANNOTATION_IMAGE_ID, ANNOTATION_PARENT_IMAGE_ID, ANNOTATION_REPOSITORY, ANNOTATION_TAG,
    Annotation, App, Dependency, EnvironmentVariable, ImageManifest, Label, MountPoint, Port,
    sanitize_ac_identifier, sanitize_ac_name,
};
use crate::tar_walk::{append_entry, clean_name, entry_link_name, entry_name, parent_dir, walk};

/// Docker images converted from a save archive are always tagged `latest`.
const DEFAULT_TAG: &str = "latest";

/// Symlinks Docker guarantees inside a container, emitted when the layer
/// does not provide them. stdout and stderr point at `/dev/console` rather
/// than `/proc/self/fd/{1,2}` so they keep working when stdio is a Unix
/// socket.
const STDIO_SYMLINKS: &[(&str, &str)] = &[
    ("/dev/stdin", "/proc/self/fd/0"),
    ("/dev/stdout", "/dev/console"),
    ("/dev/stderr", "/dev/console"),
    ("/dev/fd", "/proc/self/fd"),
];

/// Convert one Docker layer into an ACI under `output_dir`.
///
/// `cur_pwl` is the path whitelist inherited from the next-lower layer.
/// Returns the written ACI path and its manifest, whose `path_whitelist`
/// carries the accumulated whitelist for the layer above.
pub fn build_aci(
    archive: &mut DockerArchive,
    app_name: &str,
    layer_index: usize,
    layer_id: &str,
    output_dir: &Path,
    tmp_base: &Path,
    cur_pwl: Vec<String>,
) -> Result<(PathBuf, ImageManifest)> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("docker2aci-")
        .tempdir_in(tmp_base)?;

    let layer = archive.layer_data(layer_id)?;

    let layer_path = tmp_dir.path().join(format!("{layer_id}.tar"));
    let layer_file = archive.extract_layer(layer_id, &layer_path)?;

    let manifest = generate_manifest(&layer, app_name)?;

    let mut file_name = format!("{}-{}", app_name.replace('/', "-"), layer_id);
    if !layer.os.is_empty() {
        file_name.push('-');
        file_name.push_str(&layer.os);
        if !layer.architecture.is_empty() {
            file_name.push('-');
            file_name.push_str(&layer.architecture);
        }
    }
    file_name.push_str(&format!("-{layer_index}.aci"));
    let aci_path = output_dir.join(file_name);

    let manifest = write_aci(layer_file, manifest, cur_pwl, &aci_path)?;
    aci::validate_aci(&aci_path)?;

    tracing::debug!(layer = %layer_id, path = %aci_path.display(), "built layer ACI");
    Ok((aci_path, manifest))
}

/// Synthesize the ACI manifest for one Docker layer.
pub fn generate_manifest(layer: &DockerImageData, app_name: &str) -> Result<ImageManifest> {
    let name = sanitize_ac_identifier(&format!("/{}-{}", app_name, layer.id))?;
    let mut manifest = ImageManifest::new(name);

    manifest.labels.push(Label::new("layer", &layer.id));
    manifest.labels.push(Label::new("version", DEFAULT_TAG));

    let mut parent_labels = Vec::new();
    if !layer.os.is_empty() {
        manifest.labels.push(Label::new("os", &layer.os));
        parent_labels.push(Label::new("os", &layer.os));
        if !layer.architecture.is_empty() {
            manifest
                .labels
                .push(Label::new("arch", &layer.architecture));
            parent_labels.push(Label::new("arch", &layer.architecture));
        }
    }

    if !layer.author.is_empty() {
        manifest
            .annotations
            .push(Annotation::new("authors", &layer.author));
    }
    if let Some(created) = layer.creation_time() {
        manifest.annotations.push(Annotation::new(
            "created",
            &created.to_rfc3339_opts(SecondsFormat::Secs, true),
        ));
    }
    if !layer.comment.is_empty() {
        manifest
            .annotations
            .push(Annotation::new("docker-comment", &layer.comment));
    }
    manifest
        .annotations
        .push(Annotation::new(ANNOTATION_REPOSITORY, app_name));
    manifest
        .annotations
        .push(Annotation::new(ANNOTATION_IMAGE_ID, &layer.id));
    manifest
        .annotations
        .push(Annotation::new(ANNOTATION_PARENT_IMAGE_ID, &layer.parent));

    if let Some(config) = &layer.config {
        if let Some(exec) = exec_command(config.entrypoint.as_deref(), config.cmd.as_deref()) {
            manifest.app = Some(build_app(config, exec)?);
        }
    }

    if !layer.parent.is_empty() {
        // Parent image names carry no registry index prefix.
        let parent_name = sanitize_ac_identifier(&format!("/{}-{}", app_name, layer.parent))?;
        manifest.dependencies.push(Dependency {
            image_name: parent_name,
            labels: parent_labels,
        });
        manifest
            .annotations
            .push(Annotation::new(ANNOTATION_TAG, DEFAULT_TAG));
    }

    Ok(manifest)
}

fn build_app(config: &DockerImageConfig, exec: Vec<String>) -> Result<App> {
    let (user, group) = parse_docker_user(&config.user);

    let environment = config
        .env
        .iter()
        .flatten()
        .map(|kv| {
            let (name, value) = kv.split_once('=').unwrap_or((kv.as_str(), ""));
            EnvironmentVariable {
                name: name.to_string(),
                value: value.to_string(),
            }
        })
        .collect();

    Ok(App {
        exec,
        user,
        group,
        working_directory: config.working_dir.clone(),
        environment,
        mount_points: volumes_to_mount_points(config.volumes.as_ref())?,
        ports: convert_ports(config.exposed_ports.as_ref(), config.port_specs.as_deref())?,
    })
}

/// Combine entrypoint and cmd into the exec line.
///
/// A command whose first element is not an absolute path is wrapped as
/// `/bin/sh -c "<quoted elements>"`.
fn exec_command(entrypoint: Option<&[String]>, cmd: Option<&[String]>) -> Option<Vec<String>> {
    if entrypoint.is_none() && cmd.is_none() {
        return None;
    }

    let mut command: Vec<String> = Vec::new();
    command.extend(entrypoint.unwrap_or_default().iter().cloned());
    command.extend(cmd.unwrap_or_default().iter().cloned());

    if !command.is_empty() && !command[0].starts_with('/') {
        let quoted: Vec<String> = command.iter().map(|arg| format!("{arg:?}")).collect();
        command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            quoted.join(" "),
        ];
    }
    Some(command)
}

/// Split a Docker `"user[:group]"` string; empty means root, a missing
/// group defaults to the root group.
fn parse_docker_user(docker_user: &str) -> (String, String) {
    if docker_user.is_empty() {
        return ("0".to_string(), "0".to_string());
    }
    let parts: Vec<&str> = docker_user.split(':').collect();
    match parts.as_slice() {
        [user] => (user.to_string(), "0".to_string()),
        [user, group, ..] => (user.to_string(), group.to_string()),
        [] => ("0".to_string(), "0".to_string()),
    }
}

/// Derive mount points from Docker volume paths.
///
/// Names are sanitized from `volume/<path>`; colliding names get a
/// `-<counter>` suffix starting at 1. The result is ordered by name.
fn volumes_to_mount_points(
    volumes: Option<&std::collections::BTreeMap<String, serde_json::Value>>,
) -> Result<Vec<MountPoint>> {
    let mut mount_points = Vec::new();
    let mut dup: std::collections::HashMap<String, u32> = std::collections::HashMap::new();

    for path in volumes.into_iter().flat_map(|m| m.keys()) {
        let sanitized = sanitize_ac_name(&clean_name(&format!("volume/{path}")))?;
        let name = match dup.get_mut(&sanitized) {
            Some(count) => {
                let suffix = *count;
                *count += 1;
                format!("{sanitized}-{suffix}")
            }
            None => {
                dup.insert(sanitized.clone(), 1);
                sanitized
            }
        };
        mount_points.push(MountPoint {
            name,
            path: path.clone(),
        });
    }

    mount_points.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(mount_points)
}

/// Derive ports from `ExposedPorts` when present, else from `PortSpecs`.
fn convert_ports(
    exposed_ports: Option<&std::collections::BTreeMap<String, serde_json::Value>>,
    port_specs: Option<&[String]>,
) -> Result<Vec<Port>> {
    let mut ports = Vec::new();

    if let Some(exposed) = exposed_ports {
        for spec in exposed.keys() {
            ports.push(parse_docker_port(spec)?);
        }
    } else if let Some(specs) = port_specs {
        for spec in specs {
            ports.push(parse_docker_port(spec)?);
        }
    }

    ports.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ports)
}

/// Parse a Docker `port[/proto]` specification; the protocol defaults to
/// `tcp`.
fn parse_docker_port(spec: &str) -> Result<Port> {
    let parts: Vec<&str> = spec.split('/').collect();
    let (port_str, protocol) = if parts.len() < 2 {
        (spec, "tcp")
    } else {
        (parts[0], parts[1])
    };

    let port: u32 = port_str
        .parse()
        .map_err(|_| ConversionError::InvalidPort(spec.to_string()))?;

    Ok(Port {
        name: sanitize_ac_name(spec)?,
        protocol: protocol.to_string(),
        port,
    })
}

/// Write one layer's ACI: `rootfs/` tree, stdio symlinks, manifest.
///
/// Returns the manifest with its `path_whitelist` set to the layer's
/// accumulated whitelist.
fn write_aci(
    layer_file: File,
    mut manifest: ImageManifest,
    cur_pwl: Vec<String>,
    output: &Path,
) -> Result<ImageManifest> {
    let aci_file = File::create(output)?;
    let mut builder = Builder::new(aci_file);

    aci::write_rootfs_dir(&mut builder)?;

    let mut file_map: HashSet<String> = HashSet::new();
    let mut whiteouts: Vec<String> = Vec::new();
    let mut pwl = cur_pwl;

    match aci::open_tar_stream(layer_file) {
        Ok(stream) => {
            let mut layer_tar = Archive::new(stream);
            walk(&mut layer_tar, |entry| {
                let name = entry_name(entry)?;
                if name == "./" {
                    return Ok(());
                }
                let rooted = clean_name(&format!("rootfs/{name}"));
                let absolute = rooted
                    .strip_prefix("rootfs")
                    .unwrap_or(rooted.as_str())
                    .to_string();

                if clean_name(&absolute) == "/dev" && !entry.header().entry_type().is_dir() {
                    return Err(ConversionError::DevNotDirectory);
                }

                file_map.insert(absolute.clone());
                if rooted.contains("/.wh.") {
                    whiteouts.push(absolute.replacen(".wh.", "", 1));
                    return Ok(());
                }

                let header = entry.header().clone();
                let link_target = match header.entry_type() {
                    EntryType::Link => entry_link_name(entry)?
                        .map(|target| clean_name(&format!("rootfs/{target}"))),
                    EntryType::Symlink => entry_link_name(entry)?,
                    _ => None,
                };
                append_entry(&mut builder, header, &rooted, link_target.as_deref(), entry)?;

                if !pwl.contains(&absolute) {
                    pwl.push(absolute);
                }
                Ok(())
            })?;
        }
        Err(ConversionError::UnknownArchiveFormat) => {
            // Empty layers in tars generated by docker save are not valid
            // archives; the converted ACI still gets its manifest and an
            // empty rootfs.
            tracing::debug!("layer payload is not an archive, treating as empty layer");
        }
        Err(other) => return Err(other),
    }

    let pwl = subtract_whiteouts(pwl, &whiteouts);
    manifest.path_whitelist = write_stdio_symlinks(&mut builder, &file_map, pwl)?;

    aci::write_manifest(&mut builder, &manifest)?;
    builder.into_inner()?;

    Ok(manifest)
}

/// Remove from `pwl` every path that a whiteout deletes, directly or via an
/// ancestor directory. The surviving whitelist is sorted.
fn subtract_whiteouts(mut pwl: Vec<String>, whiteouts: &[String]) -> Vec<String> {
    pwl.retain(|path| {
        let mut cur = path.as_str();
        while cur != "/" && cur != "." {
            if whiteouts.iter().any(|w| w == cur) {
                return false;
            }
            cur = parent_dir(cur);
        }
        true
    });
    pwl.sort();
    pwl
}

/// Emit the stdio symlinks the layer does not already provide, adding each
/// to the whitelist.
fn write_stdio_symlinks<W: std::io::Write>(
    builder: &mut Builder<W>,
    file_map: &HashSet<String>,
    mut pwl: Vec<String>,
) -> Result<Vec<String>> {
    for (name, target) in STDIO_SYMLINKS {
        if file_map.contains(*name) {
            continue;
        }
        let mut header = Header::new_gnu();
        header.set_mode(0o777);
        header.set_size(0);
        header.set_entry_type(EntryType::Symlink);
        builder.append_link(&mut header, format!("rootfs{name}"), target)?;

        if !pwl.iter().any(|p| p == name) {
            pwl.push((*name).to_string());
        }
    }
    Ok(pwl)
}
