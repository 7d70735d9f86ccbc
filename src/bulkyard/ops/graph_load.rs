//! Package graph construction: resolve a set of requested origins into a
//! fully linked [`Graph`], following §4.3 of the design: fetch metadata
//! through the bulk pool, expand flavors into DUMMY umbrellas, resolve
//! dependency strings into placeholders until the frontier is stable,
//! then generate edges, probe the repository, and reconcile against the
//! CRC database.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bulkyard_util::crc_dir_tree;
use serde::{Deserialize, Serialize};

use crate::core::bulk::{BulkJob, BulkPool};
use crate::core::flags::{DepKind, PkgFlags};
use crate::core::graph::Graph;
use crate::core::pkg::{Pkg, PkgIndex};
use crate::crcdb::CrcDb;
use crate::error::GraphError;

/// Port metadata as extracted by the external port tool. The tool's real
/// wire format is an external collaborator's concern; this is the shape
/// bulkyard needs out of it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PortMetadata {
    pub pkgfile: String,
    pub version: String,
    pub distfiles: Vec<String>,
    pub distsubdir: String,
    pub ignore: Option<String>,
    pub fetch_depends: String,
    pub extract_depends: String,
    pub patch_depends: String,
    pub build_depends: String,
    pub lib_depends: String,
    pub run_depends: String,
    pub options: Vec<String>,
    pub flavors: Vec<String>,
    pub use_linux: bool,
    pub make_jobs_number: Option<u32>,
}

impl PortMetadata {
    fn dep_string(&self, kind: DepKind) -> &str {
        match kind {
            DepKind::Fetch => &self.fetch_depends,
            DepKind::Extract => &self.extract_depends,
            DepKind::Patch => &self.patch_depends,
            DepKind::Build => &self.build_depends,
            DepKind::Lib => &self.lib_depends,
            DepKind::Run => &self.run_depends,
        }
    }
}

/// Abstraction over the external port tool invocation, so graph-loading
/// logic can be tested without shelling out.
pub trait PortMetadataSource {
    fn describe(&self, origin: &str) -> anyhow::Result<PortMetadata>;
}

/// Extracts [`PortMetadata`] by invoking `make -V...` against the port
/// directory, one process per origin, in the fixed variable order the
/// original's `childGetPackageInfo` relies on for its line-numbered
/// parse. An `@flavor` suffix on `origin` becomes `FLAVOR=<flavor>` in
/// the child's environment rather than a `make` argument.
pub struct MakeDescribeSource {
    pub ports_path: PathBuf,
    pub make_bin: String,
}

impl MakeDescribeSource {
    pub fn new(ports_path: PathBuf) -> Self {
        Self {
            ports_path,
            make_bin: "make".to_owned(),
        }
    }
}

const DESCRIBE_VARS: &[&str] = &[
    "PKGVERSION",
    "PKGFILE:T",
    "DISTFILES",
    "DIST_SUBDIR",
    "MAKE_JOBS_NUMBER",
    "IGNORE",
    "FETCH_DEPENDS",
    "EXTRACT_DEPENDS",
    "PATCH_DEPENDS",
    "BUILD_DEPENDS",
    "LIB_DEPENDS",
    "RUN_DEPENDS",
    "SELECTED_OPTIONS",
    "USE_LINUX",
    "FLAVORS",
];

impl PortMetadataSource for MakeDescribeSource {
    fn describe(&self, origin: &str) -> anyhow::Result<PortMetadata> {
        let (base, flavor) = Pkg::split_flavor(origin);
        let dir = self.ports_path.join(base);

        let mut cmd = std::process::Command::new(&self.make_bin);
        cmd.current_dir(&dir);
        if let Some(flavor) = flavor {
            cmd.env("FLAVOR", flavor);
        }
        for var in DESCRIBE_VARS {
            cmd.arg(format!("-V{var}"));
        }

        let output = cmd.output()?;
        if !output.status.success() {
            anyhow::bail!(
                "make -V in {} exited with {}: {}",
                dir.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let mut lines = String::from_utf8_lossy(&output.stdout).lines().map(str::to_owned).collect::<Vec<_>>();
        lines.resize(DESCRIBE_VARS.len(), String::new());
        let mut lines = lines.into_iter();
        let mut next = || lines.next().unwrap_or_default();

        Ok(PortMetadata {
            version: next(),
            pkgfile: next(),
            distfiles: split_ws(&next()),
            distsubdir: next(),
            make_jobs_number: next().trim().parse().ok(),
            ignore: {
                let v = next();
                (!v.trim().is_empty()).then_some(v)
            },
            fetch_depends: next(),
            extract_depends: next(),
            patch_depends: next(),
            build_depends: next(),
            lib_depends: next(),
            run_depends: next(),
            options: split_ws(&next()),
            use_linux: parse_yes(&next()),
            flavors: split_ws(&next()),
        })
    }
}

fn split_ws(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_owned).collect()
}

fn parse_yes(s: &str) -> bool {
    matches!(s.trim(), "yes" | "YES" | "1")
}

pub struct GraphLoadConfig {
    pub ports_path: PathBuf,
    pub repo_dir: PathBuf,
    pub bulk_jobs: usize,
    pub override_pkg_delete: bool,
}

/// Parse a space-separated `tag:origin` dependency string into the bare
/// origins it references, stripping a configured ports-path prefix and
/// keeping an optional `@flavor` suffix.
fn parse_dep_string(s: &str, ports_path: &Path) -> Vec<String> {
    let prefix = ports_path.to_string_lossy().into_owned();
    s.split_whitespace()
        .filter_map(|tok| {
            let origin = tok.rsplit_once(':').map(|(_, o)| o).unwrap_or(tok);
            let origin = origin.strip_prefix(&prefix).unwrap_or(origin);
            let origin = origin.trim_start_matches('/');
            if origin.is_empty() {
                None
            } else {
                Some(origin.to_owned())
            }
        })
        .collect()
}

fn fetch_all(
    origins: Vec<String>,
    source: Arc<dyn PortMetadataSource + Send + Sync>,
    jobs: usize,
) -> Vec<(String, Result<PortMetadata, String>)> {
    let pool = BulkPool::new(
        jobs,
        Arc::new(move |job: &mut BulkJob| {
            let origin = job.s1.clone().unwrap_or_default();
            match source.describe(&origin) {
                Ok(meta) => job.r1 = Some(serde_json::to_string(&meta).unwrap_or_default()),
                Err(e) => job.r2 = Some(e.to_string()),
            }
        }),
    );

    for origin in &origins {
        pool.submit(BulkJob {
            s1: Some(origin.clone()),
            ..Default::default()
        });
    }

    let mut out = Vec::with_capacity(origins.len());
    for _ in 0..origins.len() {
        if let Some(job) = pool.poll() {
            let origin = job.s1.unwrap_or_default();
            match job.r1 {
                Some(json) => match serde_json::from_str::<PortMetadata>(&json) {
                    Ok(meta) => out.push((origin, Ok(meta))),
                    Err(e) => out.push((origin, Err(e.to_string()))),
                },
                None => out.push((origin, Err(job.r2.unwrap_or_else(|| "unknown error".into())))),
            }
        }
    }
    pool.done();
    out
}

/// Build the concrete (non-DUMMY) node a placeholder resolves to once its
/// metadata has been fetched.
fn concrete_pkg_from_meta(origin: &str, meta: &PortMetadata) -> Pkg {
    let mut pkg = Pkg::new(origin.to_owned(), meta.pkgfile.clone());
    pkg.version = meta.version.clone();
    pkg.distfiles = meta.distfiles.clone();
    pkg.distsubdir = meta.distsubdir.clone();
    pkg.ignore = meta.ignore.clone();
    pkg.dep_strings.fetch = meta.fetch_depends.clone();
    pkg.dep_strings.extract = meta.extract_depends.clone();
    pkg.dep_strings.patch = meta.patch_depends.clone();
    pkg.dep_strings.build = meta.build_depends.clone();
    pkg.dep_strings.lib = meta.lib_depends.clone();
    pkg.dep_strings.run = meta.run_depends.clone();
    pkg.options = meta.options.clone();
    pkg.use_linux = meta.use_linux;
    pkg.make_jobs_number = meta.make_jobs_number;
    pkg
}

/// Insert a `PLACEHOLD` node for `origin` if one doesn't already exist,
/// and queue it for metadata fetch. Every origin the frontier discovers
/// (root, flavor child, or dependency) goes through this single entry
/// point, so `index` always has a slot to resolve an edge against even
/// before that origin's own metadata has come back.
fn discover(
    origin: String,
    graph: &mut Graph,
    index: &mut HashMap<String, PkgIndex>,
    pending: &mut VecDeque<String>,
) {
    if index.contains_key(&origin) {
        return;
    }
    let idx = graph.insert(Pkg::placeholder(origin.clone()));
    index.insert(origin.clone(), idx);
    pending.push_back(origin);
}

pub fn load_graph(
    requested: &[String],
    source: Arc<dyn PortMetadataSource + Send + Sync>,
    crcdb: &CrcDb,
    cfg: &GraphLoadConfig,
) -> Result<Graph, GraphError> {
    let mut graph = Graph::new();
    let mut index: HashMap<String, PkgIndex> = HashMap::new();
    let mut pending: VecDeque<String> = VecDeque::new();

    for origin in requested {
        discover(origin.clone(), &mut graph, &mut index, &mut pending);
    }

    // Resolve the frontier one batch at a time: fetch metadata for every
    // pending origin, replace its placeholder with the real node (DUMMY
    // umbrella or concrete), and discover whatever flavor children or
    // dependency origins that metadata names, until nothing new turns up.
    while !pending.is_empty() {
        let batch: Vec<String> = pending.drain(..).collect();
        for (origin, result) in fetch_all(batch, source.clone(), cfg.bulk_jobs) {
            let idx = index[&origin];
            match result {
                Ok(meta) => {
                    if meta.flavors.is_empty() {
                        graph.fill_placeholder(idx, concrete_pkg_from_meta(&origin, &meta));
                        for kind in DepKind::ALL {
                            for dep_origin in parse_dep_string(meta.dep_string(kind), &cfg.ports_path) {
                                discover(dep_origin, &mut graph, &mut index, &mut pending);
                            }
                        }
                    } else {
                        let mut dummy = Pkg::dummy(origin.clone());
                        dummy.flavors = meta.flavors.clone();
                        graph.fill_placeholder(idx, dummy);
                        for flavor in &meta.flavors {
                            discover(format!("{origin}@{flavor}"), &mut graph, &mut index, &mut pending);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(origin = %origin, error = %e, "port metadata unavailable");
                    let pkg = graph.get_mut(idx);
                    pkg.flags.remove(PkgFlags::PLACEHOLD);
                    pkg.flags.insert(PkgFlags::NOTFOUND);
                }
            }
        }
    }

    // Pass 2: wire DUMMY -> flavor-child edges, in declared flavor order,
    // so `idepon.first()` is the default flavor.
    for dummy_idx in 0..graph.len() {
        if !graph.get(dummy_idx).is_dummy() {
            continue;
        }
        let origin = graph.get(dummy_idx).portdir.clone();
        let flavors = graph.get(dummy_idx).flavors.clone();
        for flavor in &flavors {
            let child = format!("{origin}@{flavor}");
            if let Some(&child_idx) = index.get(&child) {
                graph.add_edge(dummy_idx, child_idx, DepKind::Run);
            }
        }
    }

    // Pass 3: real dependency edges for every concrete node.
    for from in 0..graph.len() {
        if graph.get(from).is_dummy() || graph.get(from).flags.contains(PkgFlags::NOTFOUND) {
            continue;
        }
        for kind in DepKind::ALL {
            let dep_string = graph.get(from).dep_strings.get(kind).to_owned();
            for dep_origin in parse_dep_string(&dep_string, &cfg.ports_path) {
                if let Some(&to) = index.get(&dep_origin) {
                    graph.add_edge(from, to, kind);
                }
            }
        }
    }

    // Probe the repository and reconcile against the CRC database.
    for (origin, &idx) in &index {
        if graph.get(idx).is_dummy() || graph.get(idx).flags.contains(PkgFlags::NOTFOUND) {
            continue;
        }
        let pkg = graph.get(idx);
        if pkg.pkgfile.is_empty() {
            continue;
        }
        let artifact = cfg.repo_dir.join(&pkg.pkgfile);
        let packaged_on_disk = artifact.is_file();

        let port_dir = cfg.ports_path.join(Pkg::split_flavor(origin).0);
        let current_crc = crc_dir_tree(&port_dir).ok();
        let stored_crc = crcdb.get(origin).ok().flatten();

        let crc_matches = matches!((current_crc, stored_crc), (Some(a), Some(b)) if a == b);

        if packaged_on_disk && crc_matches {
            graph.get_mut(idx).flags |= PkgFlags::PACKAGED;
        } else if packaged_on_disk && !crc_matches {
            if !cfg.override_pkg_delete {
                let _ = std::fs::remove_file(&artifact);
            }
        }
        if let Some(crc) = current_crc {
            graph.get_mut(idx).crc32 = Some(crc);
            if stored_crc != Some(crc) {
                let _ = crcdb.set(origin, crc);
            }
        }
    }

    graph.roots = requested
        .iter()
        .filter_map(|o| index.get(o).copied())
        .collect();

    graph.compute_derived_counts()?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeSource(Mutex<HashMap<String, PortMetadata>>);

    impl PortMetadataSource for FakeSource {
        fn describe(&self, origin: &str) -> anyhow::Result<PortMetadata> {
            self.0
                .lock()
                .unwrap()
                .get(origin)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such port: {origin}"))
        }
    }

    fn meta(pkgfile: &str, run_depends: &str) -> PortMetadata {
        PortMetadata {
            pkgfile: pkgfile.to_owned(),
            version: "1.0".to_owned(),
            run_depends: run_depends.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn linear_chain_resolves_transitive_dependencies() {
        let mut ports = HashMap::new();
        ports.insert("lang/a".to_owned(), meta("a-1.0.pkg", "run:lang/b"));
        ports.insert("lang/b".to_owned(), meta("b-1.0.pkg", "run:lang/c"));
        ports.insert("lang/c".to_owned(), meta("c-1.0.pkg", ""));
        let source = Arc::new(FakeSource(Mutex::new(ports)));

        let dir = tempfile::tempdir().unwrap();
        let crcdb = CrcDb::open_in_memory().unwrap();
        let cfg = GraphLoadConfig {
            ports_path: dir.path().to_path_buf(),
            repo_dir: dir.path().to_path_buf(),
            bulk_jobs: 2,
            override_pkg_delete: false,
        };

        let graph = load_graph(&["lang/a".to_owned()], source, &crcdb, &cfg).unwrap();

        assert_eq!(graph.len(), 3);
        let a = graph.find_by_portdir("lang/a").unwrap();
        let b = graph.find_by_portdir("lang/b").unwrap();
        let c = graph.find_by_portdir("lang/c").unwrap();
        assert_eq!(graph.get(a).idepon[0].to, b);
        assert_eq!(graph.get(b).idepon[0].to, c);
        assert_eq!(graph.get(c).depi_depth, 2);
    }

    #[test]
    fn missing_port_is_marked_notfound() {
        let ports = HashMap::new();
        let source = Arc::new(FakeSource(Mutex::new(ports)));
        let dir = tempfile::tempdir().unwrap();
        let crcdb = CrcDb::open_in_memory().unwrap();
        let cfg = GraphLoadConfig {
            ports_path: dir.path().to_path_buf(),
            repo_dir: dir.path().to_path_buf(),
            bulk_jobs: 2,
            override_pkg_delete: false,
        };

        let graph = load_graph(&["lang/missing".to_owned()], source, &crcdb, &cfg).unwrap();
        let idx = graph.find_by_portdir("lang/missing").unwrap();
        assert!(graph.get(idx).flags.contains(PkgFlags::NOTFOUND));
        assert!(!graph.get(idx).flags.contains(PkgFlags::PLACEHOLD));
    }

    #[test]
    fn flavor_umbrella_resolves_through_a_placeholder() {
        let mut ports = HashMap::new();
        ports.insert(
            "lang/a".to_owned(),
            PortMetadata {
                pkgfile: String::new(),
                version: "1.0".to_owned(),
                flavors: vec!["py39".to_owned(), "py310".to_owned()],
                ..Default::default()
            },
        );
        ports.insert("lang/a@py39".to_owned(), meta("a-py39-1.0.pkg", ""));
        ports.insert("lang/a@py310".to_owned(), meta("a-py310-1.0.pkg", ""));
        let source = Arc::new(FakeSource(Mutex::new(ports)));

        let dir = tempfile::tempdir().unwrap();
        let crcdb = CrcDb::open_in_memory().unwrap();
        let cfg = GraphLoadConfig {
            ports_path: dir.path().to_path_buf(),
            repo_dir: dir.path().to_path_buf(),
            bulk_jobs: 2,
            override_pkg_delete: false,
        };

        let graph = load_graph(&["lang/a".to_owned()], source, &crcdb, &cfg).unwrap();

        let dummy = graph.find_by_portdir("lang/a").unwrap();
        assert!(graph.get(dummy).is_dummy());
        assert!(!graph.get(dummy).flags.contains(PkgFlags::PLACEHOLD));
        let py39 = graph.find_by_portdir("lang/a@py39").unwrap();
        assert_eq!(graph.get(dummy).idepon[0].to, py39);
    }
}
