//! The in-memory package DAG.
//!
//! Nodes live in one arena (`Vec<Pkg>`); edges are indices into that arena
//! rather than owning references, so bidirectional edges (`idepon` /
//! `deponi`) don't need `Rc`/`RefCell` or unsafe aliasing to express. Two
//! hash indexes (`portdir`, `pkgfile`) let either primary key resolve to a
//! node in O(1).

use std::collections::HashMap;

use super::flags::{DepKind, PkgFlags};
use super::pkg::{Edge, Pkg, PkgIndex};
use crate::error::GraphError;

#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Pkg>,
    by_portdir: HashMap<String, PkgIndex>,
    by_pkgfile: HashMap<String, PkgIndex>,
    /// Origins explicitly requested on the command line, as opposed to
    /// ones pulled in transitively.
    pub roots: Vec<PkgIndex>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, idx: PkgIndex) -> &Pkg {
        &self.nodes[idx]
    }

    pub fn get_mut(&mut self, idx: PkgIndex) -> &mut Pkg {
        &mut self.nodes[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (PkgIndex, &Pkg)> {
        self.nodes.iter().enumerate()
    }

    pub fn find_by_portdir(&self, portdir: &str) -> Option<PkgIndex> {
        self.by_portdir.get(portdir).copied()
    }

    pub fn find_by_pkgfile(&self, pkgfile: &str) -> Option<PkgIndex> {
        self.by_pkgfile.get(pkgfile).copied()
    }

    /// Insert a new node, indexing it by whichever of `portdir`/`pkgfile`
    /// is non-empty. Returns the new index.
    pub fn insert(&mut self, pkg: Pkg) -> PkgIndex {
        let idx = self.nodes.len();
        if !pkg.portdir.is_empty() {
            self.by_portdir.insert(pkg.portdir.clone(), idx);
        }
        if !pkg.pkgfile.is_empty() {
            self.by_pkgfile.insert(pkg.pkgfile.clone(), idx);
        }
        self.nodes.push(pkg);
        idx
    }

    /// Replace a placeholder node's contents in place once its real
    /// definition arrives, preserving its index (and therefore every edge
    /// that already points at it).
    pub fn fill_placeholder(&mut self, idx: PkgIndex, real: Pkg) {
        if !real.pkgfile.is_empty() {
            self.by_pkgfile.insert(real.pkgfile.clone(), idx);
        }
        let portdir = self.nodes[idx].portdir.clone();
        self.nodes[idx] = real;
        self.nodes[idx].portdir = portdir;
    }

    /// Add a dependency edge `from -> to` of kind `kind`. If `to` is a
    /// DUMMY flavor umbrella, the edge is redirected to its first child
    /// (the default flavor), per the default-flavor-resolution rule.
    pub fn add_edge(&mut self, from: PkgIndex, to: PkgIndex, kind: DepKind) {
        let resolved = self.resolve_default_flavor(to);
        self.nodes[from].idepon.push(Edge { to: resolved, kind });
        self.nodes[resolved].deponi.push(Edge { to: from, kind });
    }

    fn resolve_default_flavor(&self, idx: PkgIndex) -> PkgIndex {
        if self.nodes[idx].is_dummy() {
            if let Some(edge) = self.nodes[idx].idepon.first() {
                return edge.to;
            }
        }
        idx
    }

    /// Compute `idep_count`/`depi_count` as the raw edge-list lengths and
    /// `depi_depth` in one post-order pass over the reverse-dependency
    /// graph, per the invariant `depi_depth(n) = 1 + max(depi_depth(p))`
    /// over parents `p` that depend on `n` (0 if no such parent exists).
    pub fn compute_derived_counts(&mut self) -> Result<(), GraphError> {
        for idx in 0..self.nodes.len() {
            self.nodes[idx].idep_count = self.nodes[idx].idepon.len() as u32;
            self.nodes[idx].depi_count = self.nodes[idx].deponi.len() as u32;
        }

        let mut memo: Vec<Option<u32>> = vec![None; self.nodes.len()];
        let mut on_stack = vec![false; self.nodes.len()];
        for idx in 0..self.nodes.len() {
            self.depi_depth_of(idx, &mut memo, &mut on_stack)?;
        }
        for (idx, depth) in memo.into_iter().enumerate() {
            self.nodes[idx].depi_depth = depth.unwrap_or(0);
        }
        Ok(())
    }

    fn depi_depth_of(
        &self,
        idx: PkgIndex,
        memo: &mut [Option<u32>],
        on_stack: &mut [bool],
    ) -> Result<u32, GraphError> {
        if let Some(d) = memo[idx] {
            return Ok(d);
        }
        if on_stack[idx] {
            return Err(GraphError::Cycle {
                origin: self.nodes[idx].portdir.clone(),
            });
        }
        on_stack[idx] = true;
        let mut depth = 0u32;
        for edge in &self.nodes[idx].deponi {
            depth = depth.max(1 + self.depi_depth_of(edge.to, memo, on_stack)?);
        }
        on_stack[idx] = false;
        memo[idx] = Some(depth);
        Ok(depth)
    }

    /// Clear PACKAGED and queue the on-disk artifact for removal (subject
    /// to the operator override policy), as required whenever a packaged
    /// node is found to have a non-PACKAGED transitive dependency.
    pub fn invalidate_packaged(&mut self, idx: PkgIndex) {
        self.nodes[idx].flags.remove(PkgFlags::PACKAGED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_into_dummy_resolves_to_first_child() {
        let mut g = Graph::new();
        let dummy = g.insert(Pkg::dummy("lang/foo"));
        let flavor_a = g.insert(Pkg::new("lang/foo@a", "foo-a-1.0.pkg"));
        let flavor_b = g.insert(Pkg::new("lang/foo@b", "foo-b-1.0.pkg"));
        g.add_edge(dummy, flavor_a, DepKind::Run);
        g.add_edge(dummy, flavor_b, DepKind::Run);

        let x = g.insert(Pkg::new("lang/x", "x-1.0.pkg"));
        g.add_edge(x, dummy, DepKind::Run);

        assert_eq!(g.get(x).idepon[0].to, flavor_a);
    }

    #[test]
    fn depi_depth_grows_toward_foundational_packages() {
        let mut g = Graph::new();
        let c = g.insert(Pkg::new("devel/c", "c-1.pkg"));
        let b = g.insert(Pkg::new("devel/b", "b-1.pkg"));
        let a = g.insert(Pkg::new("devel/a", "a-1.pkg"));
        g.add_edge(a, b, DepKind::Build);
        g.add_edge(b, c, DepKind::Build);

        g.compute_derived_counts().unwrap();

        assert_eq!(g.get(a).depi_depth, 0);
        assert_eq!(g.get(b).depi_depth, 1);
        assert_eq!(g.get(c).depi_depth, 2);
    }

    #[test]
    fn cycle_is_reported_as_an_error() {
        let mut g = Graph::new();
        let a = g.insert(Pkg::new("devel/a", "a-1.pkg"));
        let b = g.insert(Pkg::new("devel/b", "b-1.pkg"));
        g.add_edge(a, b, DepKind::Build);
        g.add_edge(b, a, DepKind::Build);

        assert!(g.compute_derived_counts().is_err());
    }
}
