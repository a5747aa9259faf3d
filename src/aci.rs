//! ACI archive primitives.
//!
//! An ACI is a tar archive (optionally gzip-compressed) whose required
//! entries are a `manifest` regular file and a `rootfs/` directory; all
//! other entries must live under `rootfs/`. This module provides the
//! pieces every pipeline stage shares: transparent decompression, manifest
//! extraction, archive validation, and the emission helpers for the two
//! fixed entries.
//!
//! Compression detection mirrors the file-type sniffing of the appc
//! tooling: a gzip magic at offset 0, or the `ustar` magic at offset 257
//! for a plain tar. Anything else is [`UnknownArchiveFormat`], which the
//! per-layer builder uses to tolerate the broken "empty layer" tars some
//! `docker save` versions emit.
//!
//! [`UnknownArchiveFormat`]: crate::error::ConversionError::UnknownArchiveFormat

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use tar::{Archive, Builder, EntryType, Header};

use crate::error::{ConversionError, Result};
use crate::schema::ImageManifest;
use crate::tar_walk::{clean_name, entry_name, walk};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Offset of the `ustar` magic in a tar header block.
const TAR_MAGIC_OFFSET: usize = 257;

/// A possibly-compressed tar byte stream.
#[derive(Debug)]
pub enum TarStream<R: Read> {
    /// Uncompressed tar data.
    Plain(R),
    /// Gzip-wrapped tar data, decompressed on the fly.
    Gzip(Box<GzDecoder<R>>),
}

impl<R: Read> Read for TarStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TarStream::Plain(inner) => inner.read(buf),
            TarStream::Gzip(inner) => inner.read(buf),
        }
    }
}

/// Detect the compression of `src` and return a reader yielding plain tar
/// bytes.
///
/// The source is left positioned at the start of the stream. Returns
/// [`ConversionError::UnknownArchiveFormat`] when the bytes are neither
/// gzip nor tar.
pub fn open_tar_stream<R: Read + Seek>(mut src: R) -> Result<TarStream<R>> {
    let mut block = [0u8; 512];
    let mut filled = 0;
    loop {
        let n = src.read(&mut block[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == block.len() {
            break;
        }
    }
    src.seek(SeekFrom::Start(0))?;

    if filled >= GZIP_MAGIC.len() && block[..GZIP_MAGIC.len()] == GZIP_MAGIC {
        return Ok(TarStream::Gzip(Box::new(GzDecoder::new(src))));
    }
    if filled >= TAR_MAGIC_OFFSET + 5 && &block[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar"
    {
        return Ok(TarStream::Plain(src));
    }
    Err(ConversionError::UnknownArchiveFormat)
}

/// Open an ACI file and return a decompressed tar stream over it.
pub fn open_tar_file(path: &Path) -> Result<TarStream<File>> {
    let file = File::open(path)?;
    open_tar_stream(file)
}

/// Extract and parse the `manifest` entry of an ACI file.
pub fn manifest_from_image(path: &Path) -> Result<ImageManifest> {
    let mut archive = Archive::new(open_tar_file(path)?);
    let mut manifest: Option<ImageManifest> = None;

    walk(&mut archive, |entry| {
        if manifest.is_none() && clean_name(&entry_name(entry)?) == "manifest" {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            manifest = Some(serde_json::from_slice(&bytes)?);
        }
        Ok(())
    })?;

    manifest.ok_or(ConversionError::MissingManifest)
}

/// Verify that an ACI file meets the archive contract.
///
/// The archive must contain a parseable `manifest`, a `rootfs` directory,
/// and nothing outside `rootfs/`.
pub fn validate_aci(path: &Path) -> Result<()> {
    let mut archive = Archive::new(open_tar_file(path)?);
    validate_archive(&mut archive)
}

/// Archive-level validation over an already-opened tar stream.
pub fn validate_archive<R: Read>(archive: &mut Archive<R>) -> Result<()> {
    let mut manifest_bytes: Option<Vec<u8>> = None;
    let mut rootfs_ok = false;
    let mut others: Vec<String> = Vec::new();

    walk(archive, |entry| {
        let name = clean_name(&entry_name(entry)?);
        match name.as_str() {
            "manifest" => {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes)?;
                manifest_bytes = Some(bytes);
            }
            "rootfs" => {
                if !entry.header().entry_type().is_dir() {
                    return Err(ConversionError::InvalidArchive(
                        "rootfs is not a directory".to_string(),
                    ));
                }
                rootfs_ok = true;
            }
            _ => others.push(name),
        }
        Ok(())
    })?;

    let manifest_bytes = manifest_bytes.ok_or(ConversionError::MissingManifest)?;
    if !rootfs_ok {
        return Err(ConversionError::MissingRootfs);
    }
    let _: ImageManifest = serde_json::from_slice(&manifest_bytes)?;

    for name in others {
        if !name.starts_with("rootfs") {
            return Err(ConversionError::InvalidArchive(format!(
                "file is outside rootfs: {name}"
            )));
        }
    }
    Ok(())
}

/// The shared header template for generated entries: root-owned,
/// epoch-timestamped.
pub fn generic_header() -> Result<Header> {
    let mut header = Header::new_gnu();
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_username("0")?;
    header.set_groupname("0")?;
    Ok(header)
}

/// Serialize `manifest` and append it as the `manifest` entry.
pub fn write_manifest<W: Write>(builder: &mut Builder<W>, manifest: &ImageManifest) -> Result<()> {
    let bytes = serde_json::to_vec(manifest)?;
    let mut header = generic_header()?;
    header.set_mode(0o644);
    header.set_size(bytes.len() as u64);
    header.set_entry_type(EntryType::Regular);
    builder.append_data(&mut header, "manifest", bytes.as_slice())?;
    Ok(())
}

/// Append the empty `rootfs` directory entry.
pub fn write_rootfs_dir<W: Write>(builder: &mut Builder<W>) -> Result<()> {
    let mut header = generic_header()?;
    header.set_mode(0o755);
    header.set_size(0);
    header.set_entry_type(EntryType::Directory);
    builder.append_data(&mut header, "rootfs", io::empty())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn minimal_aci_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut builder = Builder::new(&mut buf);
            write_manifest(
                &mut builder,
                &ImageManifest::new("example.com/app".to_string()),
            )
            .unwrap();
            write_rootfs_dir(&mut builder).unwrap();
            builder.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_open_tar_stream_detects_plain_tar() {
        let bytes = minimal_aci_bytes();
        let stream = open_tar_stream(Cursor::new(bytes)).unwrap();
        assert!(matches!(stream, TarStream::Plain(_)));
    }

    #[test]
    fn test_open_tar_stream_detects_gzip() {
        let bytes = minimal_aci_bytes();
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&bytes).unwrap();
        let compressed = gz.finish().unwrap();

        let stream = open_tar_stream(Cursor::new(compressed)).unwrap();
        assert!(matches!(stream, TarStream::Gzip(_)));

        let mut archive = Archive::new(stream);
        validate_archive(&mut archive).unwrap();
    }

    #[test]
    fn test_open_tar_stream_rejects_garbage() {
        let err = open_tar_stream(Cursor::new(vec![0u8; 1024])).unwrap_err();
        assert!(matches!(err, ConversionError::UnknownArchiveFormat));

        let err = open_tar_stream(Cursor::new(b"hello".to_vec())).unwrap_err();
        assert!(matches!(err, ConversionError::UnknownArchiveFormat));
    }

    #[test]
    fn test_validate_archive_requires_manifest_and_rootfs() {
        let minimal_aci_bytes = minimal_aci_bytes();
        let mut archive = Archive::new(&minimal_aci_bytes[..]);
        validate_archive(&mut archive).unwrap();

        // Missing rootfs.
        let mut buf = Vec::new();
        {
            let mut builder = Builder::new(&mut buf);
            write_manifest(&mut builder, &ImageManifest::new("app".to_string())).unwrap();
            builder.finish().unwrap();
        }
        let err = validate_archive(&mut Archive::new(&buf[..])).unwrap_err();
        assert!(matches!(err, ConversionError::MissingRootfs));

        // Missing manifest.
        let mut buf = Vec::new();
        {
            let mut builder = Builder::new(&mut buf);
            write_rootfs_dir(&mut builder).unwrap();
            builder.finish().unwrap();
        }
        let err = validate_archive(&mut Archive::new(&buf[..])).unwrap_err();
        assert!(matches!(err, ConversionError::MissingManifest));
    }

    #[test]
    fn test_validate_archive_rejects_file_outside_rootfs() {
        let mut buf = Vec::new();
        {
            let mut builder = Builder::new(&mut buf);
            write_manifest(&mut builder, &ImageManifest::new("app".to_string())).unwrap();
            write_rootfs_dir(&mut builder).unwrap();
            let mut header = generic_header().unwrap();
            header.set_mode(0o644);
            header.set_size(2);
            header.set_entry_type(EntryType::Regular);
            builder
                .append_data(&mut header, "stray", b"hi".as_slice())
                .unwrap();
            builder.finish().unwrap();
        }
        let err = validate_archive(&mut Archive::new(&buf[..])).unwrap_err();
        assert!(matches!(err, ConversionError::InvalidArchive(_)));
    }

    #[test]
    fn test_manifest_from_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.aci");
        std::fs::write(&path, minimal_aci_bytes()).unwrap();

        let manifest = manifest_from_image(&path).unwrap();
        assert_eq!(manifest.name, "example.com/app");

        validate_aci(&path).unwrap();
    }
}
