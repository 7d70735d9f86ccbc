//! Content hashing for port directory trees.
//!
//! The hash is not a single CRC of file contents; it is the XOR of a
//! per-file CRC32C computed over `(mtime, size, relative-path-bytes)`. That
//! makes the directory CRC cheap to maintain incrementally in spirit (an
//! unmodified file contributes the same value every time) while still
//! invalidating the whole port when mtimes, sizes, or the file's presence
//! change.
//!
//! The polynomial is CRC32C (Castagnoli, the "iSCSI" polynomial), not the
//! zlib/IEEE CRC32 that `crc32fast` implements. This matters: the two
//! produce different numbers for the same input, and persisted databases
//! must agree with whichever one was used to write them.

use std::fs;
use std::path::Path;

use walkdir::WalkDir;

/// Traverse `root` and fold a per-entry CRC32C into a single directory CRC.
///
/// Hidden files/directories (dotfiles) and `*.core` files are excluded.
/// Symlinks are followed physically (the link itself is hashed, not its
/// target), matching `find -P` semantics.
pub fn crc_dir_tree(root: &Path) -> std::io::Result<u32> {
    let mut acc: u32 = 0;

    for entry in WalkDir::new(root).follow_links(false).into_iter() {
        let entry = entry.map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        })?;
        let path = entry.path();

        if path != root && is_hidden(path) {
            continue;
        }
        if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("core"))
        {
            continue;
        }

        let file_type = entry.file_type();
        if !(file_type.is_file() || file_type.is_symlink()) {
            continue;
        }

        let meta = fs::symlink_metadata(path)?;
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        let rel = path.strip_prefix(root).unwrap_or(path);

        let mut buf = Vec::with_capacity(16 + rel.as_os_str().len());
        buf.extend_from_slice(&mtime.unix_seconds().to_ne_bytes());
        buf.extend_from_slice(&meta.len().to_ne_bytes());
        buf.extend_from_slice(rel.to_string_lossy().as_bytes());

        acc ^= crc32c::crc32c(&buf);
    }

    Ok(acc)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn unchanged_tree_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("Makefile"))
            .unwrap()
            .write_all(b"x")
            .unwrap();

        let a = crc_dir_tree(dir.path()).unwrap();
        let b = crc_dir_tree(dir.path()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn touching_a_file_changes_the_crc() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Makefile");
        File::create(&file).unwrap().write_all(b"x").unwrap();
        let before = crc_dir_tree(dir.path()).unwrap();

        File::create(&file).unwrap().write_all(b"xy").unwrap();
        let after = crc_dir_tree(dir.path()).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn dotfiles_and_core_dumps_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = crc_dir_tree(dir.path()).unwrap();

        File::create(dir.path().join(".hidden")).unwrap();
        File::create(dir.path().join("prog.core")).unwrap();
        let after = crc_dir_tree(dir.path()).unwrap();

        assert_eq!(baseline, after);
    }
}
