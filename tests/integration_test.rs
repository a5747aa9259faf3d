//! End-to-end conversion tests over synthesized `docker save` archives.
//!
//! Each test builds a saved-image tarball in a temp directory with
//! `tar::Builder`, runs the full conversion, and inspects the squashed
//! ACI that comes out.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tar::{Archive, Builder, EntryType, Header};
use tempfile::TempDir;

use docker2aci::schema::ANNOTATION_REPOSITORY;
use docker2aci::{ConversionError, ImageManifest, convert_file};

/// One entry of a synthesized layer tar.
enum LayerEntry<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
    HardLink { path: &'a str, target: &'a str },
}

fn layer_tar(entries: &[LayerEntry<'_>]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut builder = Builder::new(&mut buf);
        for entry in entries {
            match entry {
                LayerEntry::Dir(path) => {
                    let mut header = Header::new_gnu();
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_entry_type(EntryType::Directory);
                    header.set_cksum();
                    builder
                        .append_data(&mut header, *path, std::io::empty())
                        .unwrap();
                }
                LayerEntry::File(path, data) => {
                    let mut header = Header::new_gnu();
                    header.set_size(data.len() as u64);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder.append_data(&mut header, *path, *data).unwrap();
                }
                LayerEntry::HardLink { path, target } => {
                    let mut header = Header::new_gnu();
                    header.set_size(0);
                    header.set_mode(0o644);
                    header.set_entry_type(EntryType::Link);
                    header.set_cksum();
                    builder.append_link(&mut header, *path, *target).unwrap();
                }
            }
        }
        builder.finish().unwrap();
    }
    buf
}

/// Write a `docker save` style archive: a `repositories` index plus one
/// `<id>/json` and `<id>/layer.tar` pair per layer.
fn write_docker_archive(
    dir: &Path,
    repositories: &str,
    layers: &[(&str, String, Vec<u8>)],
) -> PathBuf {
    let path = dir.join("image.tar");
    let file = File::create(&path).unwrap();
    let mut builder = Builder::new(file);

    let add_file = |builder: &mut Builder<File>, name: &str, data: &[u8]| {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    };

    add_file(&mut builder, "repositories", repositories.as_bytes());
    for (id, json, payload) in layers {
        add_file(&mut builder, &format!("{id}/json"), json.as_bytes());
        add_file(&mut builder, &format!("{id}/layer.tar"), payload);
    }
    let mut file = builder.into_inner().unwrap();
    file.flush().unwrap();
    path
}

struct AciEntry {
    entry_type: EntryType,
    link_target: Option<String>,
    data: Vec<u8>,
}

/// Read a converted ACI into its manifest and an entry map keyed by name.
fn read_aci(path: &Path) -> (ImageManifest, HashMap<String, AciEntry>) {
    let stream = docker2aci::aci::open_tar_file(path).unwrap();
    let mut archive = Archive::new(stream);

    let mut manifest: Option<ImageManifest> = None;
    let mut entries = HashMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let link_target = entry
            .link_name()
            .unwrap()
            .map(|p| p.to_string_lossy().into_owned());
        let entry_type = entry.header().entry_type();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();

        if name == "manifest" {
            manifest = Some(serde_json::from_slice(&data).unwrap());
        }
        entries.insert(
            name,
            AciEntry {
                entry_type,
                link_target,
                data,
            },
        );
    }

    (manifest.expect("ACI has no manifest"), entries)
}

fn convert(archive: &Path) -> Result<PathBuf, ConversionError> {
    let out_dir = TempDir::new().unwrap();
    let tmp_dir = TempDir::new().unwrap();
    let path = convert_file(archive, out_dir.path(), tmp_dir.path())?;
    // Keep the output alive after the TempDir is dropped.
    let kept = archive.parent().unwrap().join(path.file_name().unwrap());
    std::fs::copy(&path, &kept).unwrap();
    Ok(kept)
}

fn layer_json(id: &str, parent: &str) -> String {
    format!(
        r#"{{"id": "{id}", "parent": "{parent}", "os": "linux", "architecture": "amd64"}}"#
    )
}

#[test]
fn test_single_layer_single_tag() {
    let dir = TempDir::new().unwrap();
    let payload = layer_tar(&[
        LayerEntry::Dir("bin/"),
        LayerEntry::File("bin/sh", b"#!/bin/sh\n"),
    ]);
    let archive = write_docker_archive(
        dir.path(),
        r#"{"alpine": {"latest": "0a1b2c3d"}}"#,
        &[("0a1b2c3d", layer_json("0a1b2c3d", ""), payload)],
    );

    let aci_path = convert(&archive).unwrap();
    assert_eq!(aci_path.file_name().unwrap(), "alpine.aci");

    let (manifest, entries) = read_aci(&aci_path);
    assert_eq!(manifest.name, "alpine");
    assert_eq!(manifest.ac_kind, "ImageManifest");
    assert_eq!(manifest.ac_version, "0.7.0");
    assert_eq!(manifest.label("version"), Some("latest"));
    assert_eq!(manifest.label("os"), Some("linux"));
    assert_eq!(manifest.label("arch"), Some("amd64"));
    // Squashing subsumes the per-layer fields.
    assert_eq!(manifest.label("layer"), None);
    assert!(manifest.dependencies.is_empty());
    assert!(manifest.path_whitelist.is_empty());
    assert_eq!(manifest.annotation(ANNOTATION_REPOSITORY), Some("alpine"));

    assert!(entries.contains_key("rootfs"));
    let sh = &entries["rootfs/bin/sh"];
    assert_eq!(sh.entry_type, EntryType::Regular);
    assert_eq!(sh.data, b"#!/bin/sh\n");

    for (name, target) in [
        ("rootfs/dev/stdin", "/proc/self/fd/0"),
        ("rootfs/dev/stdout", "/dev/console"),
        ("rootfs/dev/stderr", "/dev/console"),
        ("rootfs/dev/fd", "/proc/self/fd"),
    ] {
        let entry = &entries[name];
        assert_eq!(entry.entry_type, EntryType::Symlink, "{name}");
        assert_eq!(entry.link_target.as_deref(), Some(target), "{name}");
    }
}

#[test]
fn test_two_layer_chain_with_whiteout() {
    let dir = TempDir::new().unwrap();
    let lower = layer_tar(&[
        LayerEntry::Dir("etc/"),
        LayerEntry::File("etc/a", b"keep me"),
        LayerEntry::File("etc/b", b"delete me"),
    ]);
    let upper = layer_tar(&[
        LayerEntry::Dir("etc/"),
        LayerEntry::File("etc/.wh.b", b""),
    ]);
    let archive = write_docker_archive(
        dir.path(),
        r#"{"app": {"latest": "aaa"}}"#,
        &[
            ("aaa", layer_json("aaa", "bbb"), upper),
            ("bbb", layer_json("bbb", ""), lower),
        ],
    );

    let aci_path = convert(&archive).unwrap();
    let (_, entries) = read_aci(&aci_path);

    assert_eq!(entries["rootfs/etc/a"].data, b"keep me");
    assert!(!entries.contains_key("rootfs/etc/b"));
    assert!(
        entries.keys().all(|name| !name.contains(".wh.")),
        "whiteout markers must not survive squashing"
    );
}

#[test]
fn test_whiteout_on_directory_deletes_subtree() {
    let dir = TempDir::new().unwrap();
    let lower = layer_tar(&[
        LayerEntry::Dir("opt/"),
        LayerEntry::Dir("opt/x/"),
        LayerEntry::File("opt/x/1", b"one"),
        LayerEntry::File("opt/x/2", b"two"),
    ]);
    let upper = layer_tar(&[
        LayerEntry::Dir("opt/"),
        LayerEntry::File("opt/.wh.x", b""),
    ]);
    let archive = write_docker_archive(
        dir.path(),
        r#"{"app": {"latest": "aaa"}}"#,
        &[
            ("aaa", layer_json("aaa", "bbb"), upper),
            ("bbb", layer_json("bbb", ""), lower),
        ],
    );

    let aci_path = convert(&archive).unwrap();
    let (_, entries) = read_aci(&aci_path);

    assert!(entries.contains_key("rootfs/opt"));
    assert!(!entries.contains_key("rootfs/opt/x"));
    assert!(!entries.contains_key("rootfs/opt/x/1"));
    assert!(!entries.contains_key("rootfs/opt/x/2"));
}

#[test]
fn test_hard_link_promotion() {
    let content: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();

    let dir = TempDir::new().unwrap();
    let lower = layer_tar(&[
        LayerEntry::Dir("data/"),
        LayerEntry::File("data/orig", &content),
        LayerEntry::Dir("bin/"),
        LayerEntry::HardLink {
            path: "bin/tool",
            target: "data/orig",
        },
        LayerEntry::HardLink {
            path: "bin/tool2",
            target: "data/orig",
        },
    ]);
    let upper = layer_tar(&[
        LayerEntry::Dir("data/"),
        LayerEntry::File("data/.wh.orig", b""),
    ]);
    let archive = write_docker_archive(
        dir.path(),
        r#"{"app": {"latest": "aaa"}}"#,
        &[
            ("aaa", layer_json("aaa", "bbb"), upper),
            ("bbb", layer_json("bbb", ""), lower),
        ],
    );

    let aci_path = convert(&archive).unwrap();
    let (_, entries) = read_aci(&aci_path);

    // The content was promoted to the first link's name; the original is
    // gone.
    assert!(!entries.contains_key("rootfs/data/orig"));
    let tool = &entries["rootfs/bin/tool"];
    assert_eq!(tool.entry_type, EntryType::Regular);
    assert_eq!(tool.data.len(), content.len());
    assert_eq!(tool.data, content);

    // The remaining link now points at the promoted name.
    let tool2 = &entries["rootfs/bin/tool2"];
    assert_eq!(tool2.entry_type, EntryType::Link);
    assert_eq!(tool2.link_target.as_deref(), Some("rootfs/bin/tool"));

    // Exactly one entry carries the promoted name.
    let stream = docker2aci::aci::open_tar_file(&aci_path).unwrap();
    let mut archive = Archive::new(stream);
    let mut occurrences = 0;
    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == "rootfs/bin/tool" {
            occurrences += 1;
        }
    }
    assert_eq!(occurrences, 1);
}

#[test]
fn test_entrypoint_rewrite() {
    let dir = TempDir::new().unwrap();
    let payload = layer_tar(&[LayerEntry::Dir("bin/")]);
    let json = r#"{
        "id": "aaa",
        "parent": "",
        "config": {"Entrypoint": ["sh", "-c", "echo hi"]}
    }"#
    .to_string();
    let archive = write_docker_archive(
        dir.path(),
        r#"{"app": {"latest": "aaa"}}"#,
        &[("aaa", json, payload)],
    );

    let aci_path = convert(&archive).unwrap();
    let (manifest, _) = read_aci(&aci_path);

    let app = manifest.app.expect("manifest has no app section");
    assert_eq!(
        app.exec,
        vec!["/bin/sh", "-c", r#""sh" "-c" "echo hi""#]
    );
    assert_eq!(app.user, "0");
    assert_eq!(app.group, "0");
}

#[test]
fn test_multi_app_archive_fails_with_listing() {
    let dir = TempDir::new().unwrap();
    let payload = layer_tar(&[LayerEntry::Dir("bin/")]);
    let archive = write_docker_archive(
        dir.path(),
        r#"{"first": {"latest": "aaa"}, "second": {"latest": "bbb"}}"#,
        &[
            ("aaa", layer_json("aaa", ""), payload.clone()),
            ("bbb", layer_json("bbb", ""), payload),
        ],
    );

    match convert(&archive).unwrap_err() {
        ConversionError::MultipleImages(names) => {
            assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_empty_layer_payload_is_tolerated() {
    let dir = TempDir::new().unwrap();
    // The base layer's payload is not a valid tar at all, mirroring the
    // broken empty layers some docker save versions produce.
    let lower = vec![0u8; 1024];
    let upper = layer_tar(&[
        LayerEntry::Dir("etc/"),
        LayerEntry::File("etc/motd", b"hello"),
    ]);
    let archive = write_docker_archive(
        dir.path(),
        r#"{"app": {"latest": "aaa"}}"#,
        &[
            ("aaa", layer_json("aaa", "bbb"), upper),
            ("bbb", layer_json("bbb", ""), lower),
        ],
    );

    let aci_path = convert(&archive).unwrap();
    let (_, entries) = read_aci(&aci_path);
    assert_eq!(entries["rootfs/etc/motd"].data, b"hello");
}

#[test]
fn test_gzip_wrapped_layer_payload() {
    let dir = TempDir::new().unwrap();
    let plain = layer_tar(&[
        LayerEntry::Dir("etc/"),
        LayerEntry::File("etc/issue", b"hi"),
    ]);
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(&plain).unwrap();
    let compressed = gz.finish().unwrap();

    let archive = write_docker_archive(
        dir.path(),
        r#"{"app": {"latest": "aaa"}}"#,
        &[("aaa", layer_json("aaa", ""), compressed)],
    );

    let aci_path = convert(&archive).unwrap();
    let (_, entries) = read_aci(&aci_path);
    assert_eq!(entries["rootfs/etc/issue"].data, b"hi");
}

#[test]
fn test_missing_layer_json_fails() {
    let dir = TempDir::new().unwrap();
    let archive = write_docker_archive(
        dir.path(),
        r#"{"app": {"latest": "zzz"}}"#,
        &[("aaa", layer_json("aaa", ""), layer_tar(&[]))],
    );

    match convert(&archive).unwrap_err() {
        ConversionError::EntryNotFound(name) => assert_eq!(name, "zzz/json"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_output_replaces_slash_in_app_name() {
    let dir = TempDir::new().unwrap();
    let payload = layer_tar(&[LayerEntry::Dir("bin/")]);
    let archive = write_docker_archive(
        dir.path(),
        r#"{"quay.io/coreos/etcd": {"latest": "aaa"}}"#,
        &[("aaa", layer_json("aaa", ""), payload)],
    );

    let aci_path = convert(&archive).unwrap();
    assert_eq!(aci_path.file_name().unwrap(), "quay.io-coreos-etcd.aci");

    let (manifest, _) = read_aci(&aci_path);
    assert_eq!(manifest.name, "quay.io/coreos/etcd");
}
