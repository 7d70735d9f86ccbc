//! The package node type and its dependency edges.

use super::flags::{DepKind, PkgFlags};

/// Index into [`super::graph::Graph`]'s node arena. Edges hold indices, not
/// owning references, so the graph can have cycles detected as data rather
/// than fought as a borrow-checker problem.
pub type PkgIndex = usize;

#[derive(Debug, Clone)]
pub struct Edge {
    pub to: PkgIndex,
    pub kind: DepKind,
}

/// One node in the package DAG.
///
/// `portdir` and `pkgfile` are the two primary keys used by the graph's
/// secondary hash indexes; every node must be reachable by exactly one of
/// each.
#[derive(Debug, Clone)]
pub struct Pkg {
    pub portdir: String,
    pub pkgfile: String,
    pub version: String,
    pub distfiles: Vec<String>,
    pub distsubdir: String,
    pub ignore: Option<String>,

    pub dep_strings: DepStrings,
    pub options: Vec<String>,
    pub flavors: Vec<String>,
    pub use_linux: bool,
    pub make_jobs_number: Option<u32>,

    pub idepon: Vec<Edge>,
    pub deponi: Vec<Edge>,
    pub idep_count: u32,
    pub depi_count: u32,
    pub depi_depth: u32,

    pub crc32: Option<u32>,
    pub pkgfile_size: Option<u64>,

    pub flags: PkgFlags,
}

/// The six raw dependency strings as extracted from port metadata, each a
/// space-separated list of `tag:origin` items, before being resolved into
/// graph edges.
#[derive(Debug, Clone, Default)]
pub struct DepStrings {
    pub fetch: String,
    pub extract: String,
    pub patch: String,
    pub build: String,
    pub lib: String,
    pub run: String,
}

impl DepStrings {
    pub fn get(&self, kind: DepKind) -> &str {
        match kind {
            DepKind::Fetch => &self.fetch,
            DepKind::Extract => &self.extract,
            DepKind::Patch => &self.patch,
            DepKind::Build => &self.build,
            DepKind::Lib => &self.lib,
            DepKind::Run => &self.run,
        }
    }
}

impl Pkg {
    pub fn new(portdir: impl Into<String>, pkgfile: impl Into<String>) -> Self {
        Self {
            portdir: portdir.into(),
            pkgfile: pkgfile.into(),
            version: String::new(),
            distfiles: Vec::new(),
            distsubdir: String::new(),
            ignore: None,
            dep_strings: DepStrings::default(),
            options: Vec::new(),
            flavors: Vec::new(),
            use_linux: false,
            make_jobs_number: None,
            idepon: Vec::new(),
            deponi: Vec::new(),
            idep_count: 0,
            depi_count: 0,
            depi_depth: 0,
            crc32: None,
            pkgfile_size: None,
            flags: PkgFlags::empty(),
        }
    }

    pub fn placeholder(portdir: impl Into<String>) -> Self {
        let mut pkg = Self::new(portdir, "");
        pkg.flags |= PkgFlags::PLACEHOLD;
        pkg
    }

    pub fn dummy(portdir: impl Into<String>) -> Self {
        let mut pkg = Self::new(portdir, "");
        pkg.flags |= PkgFlags::DUMMY;
        pkg
    }

    pub fn is_dummy(&self) -> bool {
        self.flags.contains(PkgFlags::DUMMY)
    }

    /// Splits a dependency edge target of the form `category/name` or
    /// `category/name@flavor` into `(origin, flavor)`.
    pub fn split_flavor(origin: &str) -> (&str, Option<&str>) {
        match origin.split_once('@') {
            Some((base, flavor)) => (base, Some(flavor)),
            None => (origin, None),
        }
    }
}
