//! End-to-end scenarios that cross module boundaries: driving the
//! scheduler across several simulated passes the way the master loop in
//! `src/bin/bulkyard` does, and exercising `load_graph`'s CRC/PACKAGED
//! reconciliation against a real port tree on disk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bulkyard::core::flags::DepKind;
use bulkyard::core::graph::Graph;
use bulkyard::core::pkg::{Pkg, PkgIndex};
use bulkyard::core::PkgFlags;
use bulkyard::crcdb::CrcDb;
use bulkyard::ops::dynamic::{DynamicController, SystemSample};
use bulkyard::ops::graph_load::{load_graph, GraphLoadConfig, PortMetadata, PortMetadataSource};
use bulkyard::ops::scheduler::{run_pass, ReadyQueue};

/// Run `run_pass` once, hand every ready node straight to "success", and
/// repeat until a pass produces nothing new. Mirrors the master loop's
/// dispatch-then-reclassify cycle without any of the worker-slot plumbing.
fn drive_to_completion(graph: &mut Graph, repo_dir: &std::path::Path) -> Vec<Vec<PkgIndex>> {
    let mut passes = Vec::new();
    let mut first_pass = true;
    loop {
        let result = run_pass(graph, repo_dir, false, first_pass).unwrap();
        first_pass = false;
        if result.build_list.is_empty() {
            break;
        }
        for &idx in &result.build_list {
            graph.get_mut(idx).flags |= PkgFlags::SUCCESS;
        }
        passes.push(result.build_list);
    }
    passes
}

#[test]
fn linear_chain_completes_leaf_first_across_passes() {
    let mut g = Graph::new();
    let a = g.insert(Pkg::new("devel/a", "a-1.pkg"));
    let b = g.insert(Pkg::new("devel/b", "b-1.pkg"));
    let c = g.insert(Pkg::new("devel/c", "c-1.pkg"));
    g.add_edge(a, b, DepKind::Build);
    g.add_edge(b, c, DepKind::Build);
    g.roots = vec![a];
    g.compute_derived_counts().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let passes = drive_to_completion(&mut g, dir.path());

    assert_eq!(passes, vec![vec![c], vec![b], vec![a]]);
    assert!(g.get(a).flags.contains(PkgFlags::SUCCESS));
    assert!(g.get(b).flags.contains(PkgFlags::SUCCESS));
    assert!(g.get(c).flags.contains(PkgFlags::SUCCESS));
}

#[test]
fn diamond_dependent_skipped_once_one_leg_fails() {
    // a <- {b, c} <- d; b fails outright, so a can never be ready even
    // though c and d both succeed.
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

    let dir = tempfile::tempdir().unwrap();

    // First pass puts d up for build; mark it success, then b fails while
    // c succeeds.
    let first = run_pass(&mut g, dir.path(), false, true).unwrap();
    assert_eq!(first.build_list, vec![d]);
    g.get_mut(d).flags |= PkgFlags::SUCCESS;

    let second = run_pass(&mut g, dir.path(), false, false).unwrap();
    assert_eq!(second.build_list, vec![b, c]);
    g.get_mut(b).flags |= PkgFlags::FAILURE;
    g.get_mut(c).flags |= PkgFlags::SUCCESS;

    let third = run_pass(&mut g, dir.path(), false, false).unwrap();
    assert!(third.build_list.is_empty());
    assert!(g.get(a).flags.contains(PkgFlags::NOBUILD_DEP));
    assert_eq!(third.newly_skipped, vec![a]);
}

#[test]
fn packaged_parent_invalidated_when_sibling_dependency_fails() {
    // parent is already PACKAGED from a prior run; one of its two
    // dependencies is about to fail this run, which must clear PACKAGED
    // and delete the stale artifact.
    let dir = tempfile::tempdir().unwrap();
    let pkgfile = "parent-1.0.pkg";
    std::fs::write(dir.path().join(pkgfile), b"stale artifact").unwrap();

    let mut g = Graph::new();
    let parent = g.insert(Pkg::new("devel/parent", pkgfile));
    let ok_dep = g.insert(Pkg::new("devel/ok", "ok-1.pkg"));
    let bad_dep = g.insert(Pkg::new("devel/bad", "bad-1.pkg"));
    g.add_edge(parent, ok_dep, DepKind::Build);
    g.add_edge(parent, bad_dep, DepKind::Build);
    g.get_mut(parent).flags |= PkgFlags::PACKAGED;
    g.get_mut(ok_dep).flags |= PkgFlags::SUCCESS;
    g.get_mut(bad_dep).flags |= PkgFlags::FAILURE;
    g.roots = vec![parent];
    g.compute_derived_counts().unwrap();

    let result = run_pass(&mut g, dir.path(), false, true).unwrap();

    assert!(!g.get(parent).flags.contains(PkgFlags::PACKAGED));
    assert!(g.get(parent).flags.contains(PkgFlags::NOBUILD_DEP));
    assert_eq!(result.removed_artifacts, vec![dir.path().join(pkgfile)]);
    assert!(!dir.path().join(pkgfile).exists());
}

#[test]
fn packaged_parent_survives_when_override_pkg_delete_is_set() {
    // Same setup as above, but the operator passed --no-op (override the
    // physical delete): PACKAGED still clears, but the artifact on disk
    // is left alone for a later manual pass.
    let dir = tempfile::tempdir().unwrap();
    let pkgfile = "parent-1.0.pkg";
    std::fs::write(dir.path().join(pkgfile), b"stale artifact").unwrap();

    let mut g = Graph::new();
    let parent = g.insert(Pkg::new("devel/parent", pkgfile));
    let bad_dep = g.insert(Pkg::new("devel/bad", "bad-1.pkg"));
    g.add_edge(parent, bad_dep, DepKind::Build);
    g.get_mut(parent).flags |= PkgFlags::PACKAGED;
    g.get_mut(bad_dep).flags |= PkgFlags::FAILURE;
    g.roots = vec![parent];
    g.compute_derived_counts().unwrap();

    let result = run_pass(&mut g, dir.path(), true, true).unwrap();

    assert!(!g.get(parent).flags.contains(PkgFlags::PACKAGED));
    assert!(result.removed_artifacts.is_empty());
    assert!(dir.path().join(pkgfile).exists());
}

#[test]
fn ready_queue_drains_exactly_once_across_alternating_slots() {
    let mut g = Graph::new();
    let leaves: Vec<PkgIndex> = (0..5)
        .map(|i| g.insert(Pkg::new(format!("devel/leaf{i}"), format!("leaf{i}-1.pkg"))))
        .collect();
    g.compute_derived_counts().unwrap();

    let mut queue = ReadyQueue::new(&g, leaves.clone());
    let mut dispatched = Vec::new();
    let mut slot = 0usize;
    while let Some(idx) = queue.next_for_slot(slot) {
        dispatched.push(idx);
        slot += 1;
    }

    dispatched.sort();
    let mut expected = leaves;
    expected.sort();
    assert_eq!(dispatched, expected);
    assert!(queue.is_empty());
}

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

fn leaf_meta(pkgfile: &str) -> PortMetadata {
    PortMetadata {
        pkgfile: pkgfile.to_owned(),
        version: "1.0".to_owned(),
        ..Default::default()
    }
}

/// A source-tree change between two `load_graph` calls must be detected
/// through the CRC database: the first run packages the port and records
/// its CRC, a file edit changes the tree's CRC, and the second run has to
/// notice the mismatch, drop PACKAGED, and remove the stale artifact.
#[test]
fn source_change_forces_stale_artifact_off_the_packaged_set() {
    let ports_root = tempfile::tempdir().unwrap();
    let repo_dir = tempfile::tempdir().unwrap();
    let port_dir = ports_root.path().join("devel/leaf");
    std::fs::create_dir_all(&port_dir).unwrap();
    std::fs::write(port_dir.join("Makefile"), b"# v1\n").unwrap();

    let pkgfile = "leaf-1.0.pkg";
    std::fs::write(repo_dir.path().join(pkgfile), b"built artifact").unwrap();

    let mut ports = HashMap::new();
    ports.insert("devel/leaf".to_owned(), leaf_meta(pkgfile));
    let source = Arc::new(FakeSource(Mutex::new(ports)));
    let crcdb = CrcDb::open_in_memory().unwrap();
    let cfg = GraphLoadConfig {
        ports_path: ports_root.path().to_path_buf(),
        repo_dir: repo_dir.path().to_path_buf(),
        bulk_jobs: 1,
        override_pkg_delete: false,
    };

    let first = load_graph(&["devel/leaf".to_owned()], source.clone(), &crcdb, &cfg).unwrap();
    let idx = first.find_by_portdir("devel/leaf").unwrap();
    assert!(first.get(idx).flags.contains(PkgFlags::PACKAGED));

    // Edit the port tree: the CRC on the next load no longer matches what
    // was stored, even though the on-disk artifact hasn't moved.
    std::fs::write(port_dir.join("Makefile"), b"# v2, bumped\n").unwrap();

    let second = load_graph(&["devel/leaf".to_owned()], source, &crcdb, &cfg).unwrap();
    let idx2 = second.find_by_portdir("devel/leaf").unwrap();
    assert!(!second.get(idx2).flags.contains(PkgFlags::PACKAGED));
    assert!(!repo_dir.path().join(pkgfile).exists());
}

/// An unchanged source tree across two loads keeps the artifact PACKAGED;
/// this is the control case for the test above.
#[test]
fn unchanged_source_keeps_artifact_packaged_across_loads() {
    let ports_root = tempfile::tempdir().unwrap();
    let repo_dir = tempfile::tempdir().unwrap();
    let port_dir = ports_root.path().join("devel/leaf");
    std::fs::create_dir_all(&port_dir).unwrap();
    std::fs::write(port_dir.join("Makefile"), b"# stable\n").unwrap();

    let pkgfile = "leaf-1.0.pkg";
    std::fs::write(repo_dir.path().join(pkgfile), b"built artifact").unwrap();

    let mut ports = HashMap::new();
    ports.insert("devel/leaf".to_owned(), leaf_meta(pkgfile));
    let source = Arc::new(FakeSource(Mutex::new(ports)));
    let crcdb = CrcDb::open_in_memory().unwrap();
    let cfg = GraphLoadConfig {
        ports_path: ports_root.path().to_path_buf(),
        repo_dir: repo_dir.path().to_path_buf(),
        bulk_jobs: 1,
        override_pkg_delete: false,
    };

    let _ = load_graph(&["devel/leaf".to_owned()], source.clone(), &crcdb, &cfg).unwrap();
    let second = load_graph(&["devel/leaf".to_owned()], source, &crcdb, &cfg).unwrap();

    let idx = second.find_by_portdir("devel/leaf").unwrap();
    assert!(second.get(idx).flags.contains(PkgFlags::PACKAGED));
    assert!(repo_dir.path().join(pkgfile).exists());
}

/// Swap use forced to 50% must drop `DynamicMaxWorkers` to at most a
/// quarter of `MaxWorkers` within two ticks. Unlike raising the cap, there
/// is no "+1 per update" limit on the way down, so the drop lands on the
/// first tick here; the second tick confirms it holds steady, and a tick
/// fired before `TICK_INTERVAL` elapses is a no-op regardless of the
/// sampled state.
#[test]
fn swap_pressure_throttles_to_quarter_within_two_ticks() {
    use std::time::Duration;

    let mut ctrl = DynamicController::new(8, 0);
    let pegged = |load: f64, swap_pct: f64| SystemSample {
        load_avg_1min: load,
        swap_pct,
        waiting_on_page_faults: 0,
        ncpus: 4,
    };

    let t0 = std::time::Instant::now();
    let after_one = ctrl.tick(t0, pegged(0.5, 50.0), 0);
    assert_eq!(after_one, 2);

    let t1 = t0 + bulkyard::ops::dynamic::TICK_INTERVAL;
    let after_two = ctrl.tick(t1, pegged(0.5, 50.0), 0);
    assert_eq!(after_two, 2);
    assert!(after_two as f64 <= 8.0 * 0.25);

    // A tick that arrives before the interval elapses is a no-op.
    let too_soon = t1 + Duration::from_secs(1);
    assert_eq!(ctrl.tick(too_soon, pegged(0.1, 0.0), 0), 2);
}

/// A flavored port's DUMMY umbrella resolves edges to its first declared
/// flavor, end to end through `load_graph` rather than hand-built edges.
#[test]
fn flavored_dependency_resolves_through_dummy_to_default_flavor() {
    let ports_root = tempfile::tempdir().unwrap();
    let repo_dir = tempfile::tempdir().unwrap();

    let mut ports = HashMap::new();
    let mut consumer = leaf_meta("consumer-1.0.pkg");
    consumer.run_depends = "lib:devel/flavored".to_owned();
    ports.insert("devel/consumer".to_owned(), consumer);

    let mut base = leaf_meta("");
    base.flavors = vec!["py311".to_owned(), "py312".to_owned()];
    ports.insert("devel/flavored".to_owned(), base);
    ports.insert(
        "devel/flavored@py311".to_owned(),
        leaf_meta("flavored-py311-1.0.pkg"),
    );
    ports.insert(
        "devel/flavored@py312".to_owned(),
        leaf_meta("flavored-py312-1.0.pkg"),
    );

    let source = Arc::new(FakeSource(Mutex::new(ports)));
    let crcdb = CrcDb::open_in_memory().unwrap();
    let cfg = GraphLoadConfig {
        ports_path: ports_root.path().to_path_buf(),
        repo_dir: repo_dir.path().to_path_buf(),
        bulk_jobs: 1,
        override_pkg_delete: false,
    };

    let graph = load_graph(&["devel/consumer".to_owned()], source, &crcdb, &cfg).unwrap();

    let consumer_idx = graph.find_by_portdir("devel/consumer").unwrap();
    let default_flavor = graph.find_by_portdir("devel/flavored@py311").unwrap();
    assert_eq!(graph.get(consumer_idx).idepon[0].to, default_flavor);
}
