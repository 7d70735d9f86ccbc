//! The core build-list algorithm: traverse the package DAG, classify every
//! node, delete stale packaged artifacts, and produce the ordered list of
//! ready leaves the master hands to idle worker slots.
//!
//! This mirrors the original's `build_find_leaves` traversal (§4.4 of the
//! design doc) as a safe recursive walk over [`Graph`]'s arena-indexed
//! nodes rather than pointer-chasing a `pkg_t*` tree: cycles are caught by
//! a re-entrancy flag instead of being a segfault waiting to happen.

use std::collections::HashSet;

use bitflags::bitflags;

use crate::core::flags::PkgFlags;
use crate::core::graph::Graph;
use crate::core::pkg::PkgIndex;
use crate::error::GraphError;

bitflags! {
    /// Propagated up through recursive `find_leaves` calls; never stored
    /// on a node, only threaded through the call stack.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct Accum: u8 {
        const NOBUILD  = 1 << 0;
        const ERROR    = 1 << 1;
        const NOTREADY = 1 << 2;
    }
}

/// Outcome of one scheduling pass: ports newly classified terminal this
/// pass (for hook dispatch and stats), the ready build list, and any
/// artifacts the pass invalidated on disk.
#[derive(Debug, Default)]
pub struct PassResult {
    pub build_list: Vec<PkgIndex>,
    pub newly_ignored: Vec<PkgIndex>,
    pub newly_skipped: Vec<PkgIndex>,
    pub newly_success: Vec<PkgIndex>,
    pub removed_artifacts: Vec<std::path::PathBuf>,
    /// Count of `newly_success` nodes found already `PACKAGED` on the very
    /// first pass of a run, i.e. work the graph walk discovered rather
    /// than work a worker slot performed. Callers use this to announce a
    /// "visible total" that excludes pre-existing packages without
    /// disturbing the §8 total/success/fail/skip/ignore/missing balance.
    pub preexisting_success: u32,
}

/// Run one traversal of every unterminated root, classifying and queuing
/// nodes. Call this repeatedly as workers complete; a pass that returns an
/// empty `build_list` and no newly-terminal nodes means the run is either
/// finished or stuck waiting on in-flight workers.
pub fn run_pass(
    graph: &mut Graph,
    repo_dir: &std::path::Path,
    override_pkg_delete: bool,
    first_pass: bool,
) -> Result<PassResult, GraphError> {
    let mut result = PassResult::default();
    let roots = graph.roots.clone();

    for root in roots {
        if graph.get(root).flags.is_terminal() || graph.get(root).flags.contains(PkgFlags::BUILDLIST)
        {
            continue;
        }
        let mut visiting = HashSet::new();
        find_leaves(graph, root, repo_dir, override_pkg_delete, first_pass, &mut result, &mut visiting)?;
    }

    Ok(result)
}

/// Recurse into `idx`'s dependencies (if it has any left to resolve) and
/// report what the caller should see `idx` as: its terminal-propagation
/// bits, plus how many already-SUCCESS packages it represents (for the
/// `idep_count`/sort heuristics, *not* the same field as `Pkg::idep_count`
/// which is the raw static edge count computed at graph-load time).
#[allow(clippy::too_many_arguments)]
fn find_leaves(
    graph: &mut Graph,
    idx: PkgIndex,
    repo_dir: &std::path::Path,
    override_pkg_delete: bool,
    first_pass: bool,
    result: &mut PassResult,
    visiting: &mut HashSet<PkgIndex>,
) -> Result<Accum, GraphError> {
    let flags = graph.get(idx).flags;

    if flags.contains(PkgFlags::DUMMY) {
        return find_leaves_dummy(graph, idx, repo_dir, override_pkg_delete, first_pass, result, visiting);
    }

    if flags.contains(PkgFlags::SUCCESS) {
        return Ok(Accum::empty());
    }

    if flags.intersects(PkgFlags::NOBUILD_ANY) || flags.contains(PkgFlags::FAILURE) {
        return Ok(Accum::NOBUILD);
    }

    if flags.intersects(PkgFlags::BUILDLIST | PkgFlags::RUNNING) {
        return Ok(Accum::NOTREADY);
    }

    if flags.contains(PkgFlags::NOTFOUND) || flags.contains(PkgFlags::CORRUPT) {
        return Ok(Accum::NOBUILD | Accum::ERROR);
    }

    // An explicit `IGNORE` string terminates the node without looking at
    // its dependencies at all.
    if graph.get(idx).ignore.is_some() {
        graph.get_mut(idx).flags |= PkgFlags::NOBUILD_IGNORE;
        result.newly_ignored.push(idx);
        return Ok(Accum::NOBUILD);
    }

    if !visiting.insert(idx) {
        return Err(GraphError::Cycle {
            origin: graph.get(idx).portdir.clone(),
        });
    }

    let mut accum = Accum::empty();
    for i in 0..graph.get(idx).idepon.len() {
        let child = graph.get(idx).idepon[i].to;
        accum |= find_leaves(graph, child, repo_dir, override_pkg_delete, first_pass, result, visiting)?;
    }
    visiting.remove(&idx);

    let packaged = graph.get(idx).flags.contains(PkgFlags::PACKAGED);
    if packaged && accum.intersects(Accum::NOTREADY | Accum::ERROR | Accum::NOBUILD) {
        graph.invalidate_packaged(idx);
        if !override_pkg_delete {
            let path = repo_dir.join(&graph.get(idx).pkgfile);
            if path.is_file() && std::fs::remove_file(&path).is_ok() {
                result.removed_artifacts.push(path);
            }
        }
    }

    let packaged_now = graph.get(idx).flags.contains(PkgFlags::PACKAGED);
    if packaged_now && accum.is_empty() {
        graph.get_mut(idx).flags |= PkgFlags::SUCCESS;
        result.newly_success.push(idx);
        if first_pass {
            result.preexisting_success += 1;
        }
        return Ok(Accum::empty());
    }

    if !accum.contains(Accum::NOTREADY) {
        if accum.intersects(Accum::NOBUILD | Accum::ERROR) {
            graph.get_mut(idx).flags |= PkgFlags::NOBUILD_DEP;
            result.newly_skipped.push(idx);
            return Ok(Accum::NOBUILD);
        }
        graph.get_mut(idx).flags |= PkgFlags::BUILDLIST;
        result.build_list.push(idx);
    }

    Ok(Accum::NOTREADY)
}

#[allow(clippy::too_many_arguments)]
fn find_leaves_dummy(
    graph: &mut Graph,
    idx: PkgIndex,
    repo_dir: &std::path::Path,
    override_pkg_delete: bool,
    first_pass: bool,
    result: &mut PassResult,
    visiting: &mut HashSet<PkgIndex>,
) -> Result<Accum, GraphError> {
    if !visiting.insert(idx) {
        return Err(GraphError::Cycle {
            origin: graph.get(idx).portdir.clone(),
        });
    }

    let mut accum = Accum::empty();
    let mut all_success = true;
    for i in 0..graph.get(idx).idepon.len() {
        let child = graph.get(idx).idepon[i].to;
        accum |= find_leaves(graph, child, repo_dir, override_pkg_delete, first_pass, result, visiting)?;
        if !graph.get(child).flags.contains(PkgFlags::SUCCESS) {
            all_success = false;
        }
    }
    visiting.remove(&idx);

    if all_success && !accum.intersects(Accum::ERROR | Accum::NOBUILD) {
        graph.get_mut(idx).flags |= PkgFlags::SUCCESS;
    }
    Ok(accum)
}

/// Estimate the scratch footprint an install-deps step for `idx` will pull
/// in: the sum of every transitive run/lib dependency's artifact size,
/// expanded by its compression format's typical ratio (tar 1x, gz 3x,
/// xz/zst 5x, bz 3x), per §4.4 step 5.
pub fn pkg_dep_size(graph: &Graph, idx: PkgIndex) -> u64 {
    let mut seen = HashSet::new();
    let mut total = 0u64;
    let mut stack = vec![idx];
    while let Some(cur) = stack.pop() {
        if !seen.insert(cur) {
            continue;
        }
        let pkg = graph.get(cur);
        for edge in &pkg.idepon {
            if !edge.kind.counts_toward_install_size() {
                continue;
            }
            if seen.contains(&edge.to) {
                continue;
            }
            let dep = graph.get(edge.to);
            if let Some(size) = dep.pkgfile_size {
                total += size * expansion_factor(&dep.pkgfile);
            }
            stack.push(edge.to);
        }
    }
    total
}

fn expansion_factor(pkgfile: &str) -> u64 {
    if pkgfile.ends_with(".tar") {
        1
    } else if pkgfile.ends_with(".tgz") || pkgfile.ends_with(".gz") {
        3
    } else if pkgfile.ends_with(".txz") || pkgfile.ends_with(".xz") || pkgfile.ends_with(".zst") {
        5
    } else if pkgfile.ends_with(".tbz") || pkgfile.ends_with(".bz2") {
        3
    } else {
        1
    }
}

/// Sort key the dynamic dispatch loop alternates between per §4.4 step 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// Large dependency closures first, so their long tail starts early.
    IdepCountDesc,
    /// Popular, widely-depended-on packages first.
    PopularityDesc,
}

/// A dispatch-ordered view of one pass's build list: two presortings of
/// the same ready set, alternated per free slot by index parity, with a
/// shared dispatched-set so a node picked off one ordering isn't handed
/// out again off the other.
pub struct ReadyQueue {
    by_idep: Vec<PkgIndex>,
    by_popularity: Vec<PkgIndex>,
    dispatched: HashSet<PkgIndex>,
    total: usize,
}

impl ReadyQueue {
    pub fn new(graph: &Graph, ready: Vec<PkgIndex>) -> Self {
        let mut by_idep = ready.clone();
        by_idep.sort_by(|&a, &b| graph.get(b).idep_count.cmp(&graph.get(a).idep_count));

        let mut by_popularity = ready;
        by_popularity.sort_by(|&a, &b| {
            let score = |i: PkgIndex| {
                let p = graph.get(i);
                p.depi_count as u64 * p.depi_depth as u64
            };
            score(b).cmp(&score(a))
        });

        let total = by_idep.len();
        Self {
            by_idep,
            by_popularity,
            dispatched: HashSet::new(),
            total,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dispatched.len() >= self.total
    }

    /// Pick the next node for the slot at `slot_index`, alternating the
    /// two orderings by parity.
    pub fn next_for_slot(&mut self, slot_index: usize) -> Option<PkgIndex> {
        let ordering = if slot_index % 2 == 0 {
            &self.by_idep
        } else {
            &self.by_popularity
        };
        let pick = ordering.iter().find(|i| !self.dispatched.contains(i)).copied()?;
        self.dispatched.insert(pick);
        Some(pick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flags::DepKind;
    use crate::core::pkg::Pkg;

    #[test]
    fn linear_chain_all_buildable_queues_leaves_first() {
        let mut g = Graph::new();
        let a = g.insert(Pkg::new("devel/a", "a-1.pkg"));
        let b = g.insert(Pkg::new("devel/b", "b-1.pkg"));
        let c = g.insert(Pkg::new("devel/c", "c-1.pkg"));
        g.add_edge(a, b, DepKind::Build);
        g.add_edge(b, c, DepKind::Build);
        g.roots = vec![a];
        g.compute_derived_counts().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let result = run_pass(&mut g, dir.path(), false, true).unwrap();

        // Only the leaf with no unbuilt dependencies is ready this pass.
        assert_eq!(result.build_list, vec![c]);
        assert!(g.get(c).flags.contains(PkgFlags::BUILDLIST));
        assert!(!g.get(b).flags.contains(PkgFlags::BUILDLIST));
        assert!(!g.get(a).flags.contains(PkgFlags::BUILDLIST));
    }

    #[test]
    fn diamond_with_failed_dep_skips_dependents() {
        let mut g = Graph::new();
        let a = g.insert(Pkg::new("devel/a", "a-1.pkg"));
        let b = g.insert(Pkg::new("devel/b", "b-1.pkg"));
        let c = g.insert(Pkg::new("devel/c", "c-1.pkg"));
        let d = g.insert(Pkg::new("devel/d", "d-1.pkg"));
        g.add_edge(a, b, DepKind::Build);
        g.add_edge(a, c, DepKind::Build);
        g.add_edge(b, d, DepKind::Build);
        g.add_edge(c, d, DepKind::Build);
        g.roots = vec![a];
        g.compute_derived_counts().unwrap();
        g.get_mut(b).flags |= PkgFlags::FAILURE;
        g.get_mut(d).flags |= PkgFlags::SUCCESS;

        let dir = tempfile::tempdir().unwrap();
        let result = run_pass(&mut g, dir.path(), false, true).unwrap();

        assert!(g.get(b).flags.contains(PkgFlags::FAILURE));
        assert!(g.get(c).flags.contains(PkgFlags::BUILDLIST) || result.build_list.contains(&c));
        // `a` can't be classified until b/c are terminal, so it stays
        // non-terminal and non-queued this pass.
        assert!(!g.get(a).flags.is_terminal());
    }

    #[test]
    fn cycle_is_reported_as_a_graph_error() {
        let mut g = Graph::new();
        let a = g.insert(Pkg::new("devel/a", "a-1.pkg"));
        let b = g.insert(Pkg::new("devel/b", "b-1.pkg"));
        g.add_edge(a, b, DepKind::Build);
        g.add_edge(b, a, DepKind::Build);
        g.roots = vec![a];

        let dir = tempfile::tempdir().unwrap();
        assert!(run_pass(&mut g, dir.path(), false, true).is_err());
    }

    #[test]
    fn explicit_ignore_short_circuits_without_recursing() {
        let mut g = Graph::new();
        let a = g.insert(Pkg::new("devel/a", "a-1.pkg"));
        let b = g.insert(Pkg::new("devel/b", "b-1.pkg"));
        g.add_edge(a, b, DepKind::Build);
        g.get_mut(a).ignore = Some("broken on this platform".to_owned());
        g.roots = vec![a];
        g.compute_derived_counts().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let result = run_pass(&mut g, dir.path(), false, true).unwrap();

        assert!(g.get(a).flags.contains(PkgFlags::NOBUILD_IGNORE));
        assert_eq!(result.newly_ignored, vec![a]);
        assert!(result.build_list.is_empty());
    }

    #[test]
    fn ready_queue_alternates_sort_key_by_slot_parity() {
        let mut g = Graph::new();
        let small = g.insert(Pkg::new("devel/small", "small-1.pkg"));
        let big = g.insert(Pkg::new("devel/big", "big-1.pkg"));
        g.get_mut(small).idep_count = 1;
        g.get_mut(big).idep_count = 10;
        g.get_mut(small).depi_count = 10;
        g.get_mut(small).depi_depth = 5;
        g.get_mut(big).depi_count = 1;
        g.get_mut(big).depi_depth = 1;

        let mut q = ReadyQueue::new(&g, vec![small, big]);
        assert_eq!(q.next_for_slot(0), Some(big)); // even slot: idep_count desc
        let mut q2 = ReadyQueue::new(&g, vec![small, big]);
        assert_eq!(q2.next_for_slot(1), Some(small)); // odd slot: popularity desc
    }
}
