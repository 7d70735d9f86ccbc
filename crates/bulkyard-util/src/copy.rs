//! Rename-safe file placement, used to land a finished package artifact in
//! the repository directory without ever exposing a partially-written file
//! under its final name.

use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Copy `src` to `dst` by writing to `dst.new`, `fsync`ing it, and renaming
/// it over `dst`. A reader racing the writer either sees the old `dst` or
/// the complete new one, never a partial file.
pub fn copy_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    let tmp = sibling_with_suffix(dst, ".new");

    {
        let mut in_file = File::open(src)?;
        let mut out_file = File::create(&tmp)?;
        io::copy(&mut in_file, &mut out_file)?;
        out_file.sync_all()?;
    }

    fs::rename(&tmp, dst)?;
    Ok(())
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn copy_lands_full_content_under_final_name() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("pkg.tar");
        let dst = dir.path().join("repo").join("pkg.tar");
        fs::create_dir_all(dst.parent().unwrap()).unwrap();
        File::create(&src).unwrap().write_all(b"package bytes").unwrap();

        copy_atomic(&src, &dst).unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"package bytes");
        assert!(!sibling_with_suffix(&dst, ".new").exists());
    }
}
