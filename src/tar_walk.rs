//! Tar entry iteration and path handling.
//!
//! Every stage of the pipeline scans some tar archive: the input Docker
//! archive, the per-layer payloads, and the intermediate ACIs. This module
//! provides the one iteration primitive they share, plus the lexical path
//! cleaning used whenever entry names are compared.
//!
//! The byte stream handed to a [`walk`] callback is only valid until the
//! next entry is read; callbacks that need to retain content must copy it.
//! The walker never skips entries itself, all filtering happens in the
//! callback.

use std::io::Read;

use tar::{Archive, Builder, Entry, EntryType, Header};

use crate::error::Result;

/// Walk every entry of a tar archive, passing each to `f` in archive order.
///
/// Iteration stops at end-of-archive or on the first error returned by the
/// callback.
pub fn walk<R, F>(archive: &mut Archive<R>, mut f: F) -> Result<()>
where
    R: Read,
    F: FnMut(&mut Entry<'_, R>) -> Result<()>,
{
    for entry in archive.entries()? {
        let mut entry = entry?;
        f(&mut entry)?;
    }
    Ok(())
}

/// Entry name as stored in the archive (GNU long names resolved).
pub fn entry_name<R: Read>(entry: &Entry<'_, R>) -> Result<String> {
    Ok(entry.path()?.to_string_lossy().into_owned())
}

/// Link target of a hard link or symlink entry, if any.
pub fn entry_link_name<R: Read>(entry: &Entry<'_, R>) -> Result<Option<String>> {
    Ok(entry.link_name()?.map(|p| p.to_string_lossy().into_owned()))
}

/// Append one entry to a tar being written, with an explicit name and link
/// target.
///
/// Hard links and symlinks are emitted with `link_target` as their target;
/// everything else streams `data` through. The header's remaining fields
/// (mode, ownership, timestamps, size) are written as given.
pub fn append_entry<W, R>(
    builder: &mut Builder<W>,
    mut header: Header,
    name: &str,
    link_target: Option<&str>,
    data: &mut R,
) -> Result<()>
where
    W: std::io::Write,
    R: Read,
{
    match header.entry_type() {
        EntryType::Link | EntryType::Symlink => {
            builder.append_link(&mut header, name, link_target.unwrap_or_default())?;
        }
        _ => {
            builder.append_data(&mut header, name, data)?;
        }
    }
    Ok(())
}

/// Lexically clean a slash-separated path.
///
/// Collapses `.` and `..` components and repeated or trailing slashes,
/// returning the shortest equivalent path: `"./etc//a/" -> "etc/a"`,
/// `"/x/../y" -> "/y"`, `"" -> "."`.
pub fn clean_name(name: &str) -> String {
    let rooted = name.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for comp in name.split('/') {
        match comp {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Parent directory of a cleaned path: `"/etc/a" -> "/etc"`, `"/etc" -> "/"`,
/// `"rootfs/etc" -> "rootfs"`, `"etc" -> "."`.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => ".",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("./"), ".");
        assert_eq!(clean_name(""), ".");
        assert_eq!(clean_name("etc/"), "etc");
        assert_eq!(clean_name("./etc//hosts"), "etc/hosts");
        assert_eq!(clean_name("/etc/../var"), "/var");
        assert_eq!(clean_name("/.."), "/");
        assert_eq!(clean_name("a/b/../../c"), "c");
        assert_eq!(clean_name("../x"), "../x");
        assert_eq!(clean_name("rootfs/./dev"), "rootfs/dev");
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/etc/hosts"), "/etc");
        assert_eq!(parent_dir("/etc"), "/");
        assert_eq!(parent_dir("rootfs/etc/a"), "rootfs/etc");
        assert_eq!(parent_dir("rootfs"), ".");
    }

    #[test]
    fn test_walk_visits_all_entries() {
        let mut buf = Vec::new();
        {
            let mut builder = Builder::new(&mut buf);
            for (name, data) in [("a.txt", b"one".as_slice()), ("b.txt", b"two".as_slice())] {
                let mut header = Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, data).unwrap();
            }
            builder.finish().unwrap();
        }

        let mut seen = Vec::new();
        let mut archive = Archive::new(&buf[..]);
        walk(&mut archive, |entry| {
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            seen.push((entry_name(entry)?, contents));
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![
                ("a.txt".to_string(), "one".to_string()),
                ("b.txt".to_string(), "two".to_string())
            ]
        );
    }
}
