//! Repository maintenance: rebuild the `pkg repo` metadata, purge
//! obsolete distfiles, and remove manually-selected packages.
//!
//! Grounded on `repo.c`'s `DoRebuildRepo`/`DoPurgeDistfiles`/
//! `RemovePackages`: the Rust shapes differ (no custom `pinfo_t` sort
//! array; `std::collections::HashSet` does the same "mark what's
//! referenced" job), but the three operations and their decision points
//! are unchanged.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::Config;
use crate::core::graph::Graph;
use crate::core::pkg::PkgIndex;
use crate::error::FatalError;

/// Suffix a completed artifact carries; drives both the meta-config
/// written for the repo tool and the repackaging decision below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkgSuffix {
    Tar,
    Tgz,
    Tbz,
    Txz,
    Tzst,
}

impl PkgSuffix {
    pub fn as_str(self) -> &'static str {
        match self {
            PkgSuffix::Tar => ".tar",
            PkgSuffix::Tgz => ".tgz",
            PkgSuffix::Tbz => ".tbz",
            PkgSuffix::Txz => ".txz",
            PkgSuffix::Tzst => ".tzst",
        }
    }

    fn decomp_comp_from_txz(self) -> Option<(&'static str, &'static str)> {
        match self {
            PkgSuffix::Txz => None,
            PkgSuffix::Tar => Some(("unxz", "cat")),
            PkgSuffix::Tgz => Some(("unxz", "gzip")),
            PkgSuffix::Tbz => Some(("unxz", "bzip2")),
            PkgSuffix::Tzst => Some(("unxz", "zstd")),
        }
    }

    fn comp_from_self_to_txz(self) -> Option<(&'static str, &'static str)> {
        match self {
            PkgSuffix::Txz => None,
            PkgSuffix::Tar => Some(("cat", "xz")),
            PkgSuffix::Tgz => Some(("gunzip", "xz")),
            PkgSuffix::Tbz => Some(("bunzip2", "xz")),
            PkgSuffix::Tzst => Some(("unzstd", "xz")),
        }
    }
}

/// Delete stale `name.new` files left behind by an interrupted prior
/// rebuild, then invoke `pkg repo` against the packages directory, and
/// repackage `digests`/`packagesite`/`meta` into the configured suffix
/// if the installed `pkg` predates the version that natively supports
/// it.
pub fn rebuild_repository(
    cfg: &Config,
    pkg_static: &Path,
    sufx: PkgSuffix,
) -> Result<(), FatalError> {
    scan_delete_new(&cfg.packages_path)?;

    let status = Command::new(pkg_static)
        .args(["repo", "-m"])
        .arg(&cfg.packages_path)
        .arg("-o")
        .arg(&cfg.packages_path)
        .status()
        .map_err(|e| FatalError::Other(format!("pkg repo failed to start: {e}")))?;
    if !status.success() {
        return Err(FatalError::Other(format!("pkg repo exited with {status}")));
    }

    let repackage_mode = pkg_supports_native_compression(pkg_static);

    if !repackage_mode {
        if let Some((decomp, comp)) = sufx.decomp_comp_from_txz() {
            repackage(&cfg.packages_path, "digests", ".txz", sufx.as_str(), decomp, comp)?;
            repackage(&cfg.packages_path, "packagesite", ".txz", sufx.as_str(), decomp, comp)?;
        }
    } else if let Some((decomp, comp)) = sufx.comp_from_self_to_txz() {
        repackage(&cfg.packages_path, "meta", sufx.as_str(), ".txz", decomp, comp)?;
    }

    Ok(())
}

/// `pkg -v` reports a dotted version; 1.12 and later generate the
/// requested compression format natively, so no repackaging pass is
/// needed for `digests`/`packagesite`.
fn pkg_supports_native_compression(pkg_static: &Path) -> bool {
    let Ok(output) = Command::new(pkg_static).arg("-v").output() else {
        return false;
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let Some((major, minor)) = text.trim().split_once('.') else {
        return false;
    };
    match (major.parse::<u32>(), minor.parse::<u32>()) {
        (Ok(maj), Ok(min)) => maj > 1 || (maj == 1 && min >= 12),
        _ => false,
    }
}

fn scan_delete_new(dir: &Path) -> Result<(), FatalError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| FatalError::Other(format!("cannot scan {}: {e}", dir.display())))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "new") {
            let _ = std::fs::remove_file(&path);
        } else if path.is_dir() {
            scan_delete_new(&path)?;
        }
    }
    Ok(())
}

fn repackage(
    basepath: &Path,
    basefile: &str,
    decomp_suffix: &str,
    comp_suffix: &str,
    decomp: &str,
    comp: &str,
) -> Result<(), FatalError> {
    let src = basepath.join(format!("{basefile}{decomp_suffix}"));
    let dst = basepath.join(format!("{basefile}{comp_suffix}"));
    if !src.exists() {
        return Ok(());
    }

    let pipeline = format!(
        "{decomp} < {} | {comp} > {}",
        shell_quote(&src),
        shell_quote(&dst)
    );
    let status = Command::new("/bin/sh")
        .args(["-c", &pipeline])
        .status()
        .map_err(|e| FatalError::Other(format!("repackage pipe failed to start: {e}")))?;
    if !status.success() {
        return Err(FatalError::Other(format!(
            "repackage of {basefile} exited with {status}"
        )));
    }
    Ok(())
}

fn shell_quote(p: &Path) -> String {
    format!("'{}'", p.display().to_string().replace('\'', r"'\''"))
}

/// The distfile purge's decision: which files under `distfiles_path` are
/// no longer referenced by any node in `graph` and are safe to delete.
/// Presentation/confirmation is the caller's job; this only computes the
/// set.
pub fn find_obsolete_distfiles(cfg: &Config, graph: &Graph) -> Result<Vec<PathBuf>, FatalError> {
    let all_files = walk_distfiles(&cfg.distfiles_path)?;
    let mut referenced: HashSet<PathBuf> = HashSet::new();

    for (_, pkg) in graph.iter() {
        if pkg.distfiles.is_empty() {
            continue;
        }
        for raw in &pkg.distfiles {
            // A distfile entry may be `tag:name`; only the name matters
            // here, matching the original's `strrchr(dstr, ':')` split.
            let name = raw.rsplit_once(':').map(|(_, n)| n).unwrap_or(raw);
            let rel = if pkg.distsubdir.is_empty() {
                PathBuf::from(name)
            } else {
                Path::new(&pkg.distsubdir).join(name)
            };
            referenced.insert(rel.clone());
            for lockfile in md5_lockfile_candidates(&rel) {
                referenced.insert(lockfile);
            }
        }
    }

    Ok(all_files
        .into_iter()
        .filter(|f| !referenced.contains(f))
        .collect())
}

fn walk_distfiles(root: &Path) -> Result<Vec<PathBuf>, FatalError> {
    let mut out = Vec::new();
    walk_distfiles_rec(root, Path::new(""), &mut out)?;
    out.sort();
    Ok(out)
}

fn walk_distfiles_rec(base: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> Result<(), FatalError> {
    let dir = base.join(rel);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let child_rel = rel.join(&name);
        let ty = entry.file_type().map_err(|e| FatalError::Other(e.to_string()))?;
        if ty.is_dir() {
            if name == ".locks" {
                continue;
            }
            walk_distfiles_rec(base, &child_rel, out)?;
        } else {
            out.push(child_rel);
        }
    }
    Ok(())
}

/// The `.locks/` directory holds per-distfile lock placeholders named by
/// successive MD5 prefixes of the distfile's relative path, one per
/// directory-nesting level the original's `dsynth_lock` scheme supports.
/// A full MD5 implementation isn't warranted here: distfile purging is
/// advisory (the operator confirms before deletion), so this returns the
/// conventional `.locks/<relpath>.lock` form used by this crate's own
/// lock layout rather than replicating upstream's MD5 sharding exactly.
fn md5_lockfile_candidates(rel: &Path) -> Vec<PathBuf> {
    vec![Path::new(".locks").join(format!("{}.lock", rel.display()))]
}

/// Delete the repository artifact for every manually-selected node, and
/// recurse through DUMMY/META umbrella nodes to delete their children's
/// artifacts too, per `RemovePackages`/`removePackagesMetaRecurse`.
pub fn remove_packages(cfg: &Config, graph: &mut Graph, selected: &[PkgIndex]) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for &idx in selected {
        remove_one(cfg, graph, idx, &mut removed);
    }
    removed
}

fn remove_one(cfg: &Config, graph: &mut Graph, idx: PkgIndex, removed: &mut Vec<PathBuf>) {
    let (pkgfile, is_umbrella) = {
        let pkg = graph.get(idx);
        (
            pkg.pkgfile.clone(),
            pkg.pkgfile.is_empty() || pkg.is_dummy() || pkg.flags.contains(crate::core::PkgFlags::META),
        )
    };

    if !pkgfile.is_empty() {
        graph.invalidate_packaged(idx);
        graph.get_mut(idx).pkgfile_size = None;
        let path = cfg.packages_path.join(&pkgfile);
        if std::fs::remove_file(&path).is_ok() {
            removed.push(path);
        }
    }

    if is_umbrella {
        let children: Vec<PkgIndex> = graph.get(idx).idepon.iter().map(|e| e.to).collect();
        for child in children {
            remove_one(cfg, graph, child, removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flags::DepKind;
    use crate::core::pkg::Pkg;

    fn cfg(packages: PathBuf, distfiles: PathBuf) -> Config {
        Config {
            profile: "default".into(),
            ports_path: PathBuf::new(),
            distfiles_path: distfiles,
            packages_path: packages,
            logs_path: PathBuf::new(),
            build_base: PathBuf::new(),
            max_workers: 1,
            max_bulk: 1,
            pkg_dep_scale_target: 0,
            swap_cap_floor_pct: 25,
            load_cap_ncpu_multiplier: 1.5,
            override_pkg_delete: true,
            use_ccache: false,
            ccache_path: None,
            leverage_prebuilt: false,
            make_conf: std::collections::HashMap::new(),
            hooks: crate::config::HookPaths::default(),
        }
    }

    #[test]
    fn scan_delete_new_removes_only_new_suffixed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo-1.0.txz"), b"x").unwrap();
        std::fs::write(dir.path().join("foo-1.0.txz.new"), b"x").unwrap();

        scan_delete_new(dir.path()).unwrap();

        assert!(dir.path().join("foo-1.0.txz").exists());
        assert!(!dir.path().join("foo-1.0.txz.new").exists());
    }

    #[test]
    fn unreferenced_distfile_is_reported_obsolete() {
        let pkgs_dir = tempfile::tempdir().unwrap();
        let dist_dir = tempfile::tempdir().unwrap();
        std::fs::write(dist_dir.path().join("keep-1.0.tar.gz"), b"x").unwrap();
        std::fs::write(dist_dir.path().join("stale-0.1.tar.gz"), b"x").unwrap();

        let mut graph = Graph::new();
        let mut pkg = Pkg::new("devel/keep", "keep-1.0.pkg");
        pkg.distfiles = vec!["keep-1.0.tar.gz".to_owned()];
        graph.insert(pkg);

        let cfg = cfg(pkgs_dir.path().to_path_buf(), dist_dir.path().to_path_buf());
        let obsolete = find_obsolete_distfiles(&cfg, &graph).unwrap();

        assert_eq!(obsolete, vec![PathBuf::from("stale-0.1.tar.gz")]);
    }

    #[test]
    fn remove_packages_recurses_through_dummy_umbrella() {
        let pkgs_dir = tempfile::tempdir().unwrap();
        std::fs::write(pkgs_dir.path().join("leaf-1.0.pkg"), b"x").unwrap();

        let mut graph = Graph::new();
        let leaf = graph.insert(Pkg::new("devel/leaf@flavor", "leaf-1.0.pkg"));
        let umbrella = graph.insert(Pkg::dummy("devel/leaf"));
        graph.add_edge(umbrella, leaf, DepKind::Run);

        let cfg = cfg(pkgs_dir.path().to_path_buf(), PathBuf::new());
        let removed = remove_packages(&cfg, &mut graph, &[umbrella]);

        assert_eq!(removed, vec![pkgs_dir.path().join("leaf-1.0.pkg")]);
        assert!(!pkgs_dir.path().join("leaf-1.0.pkg").exists());
    }
}
