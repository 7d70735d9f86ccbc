//! Binary entry point: parses the CLI, loads configuration, and either
//! dispatches into one of the operator-facing directives or (for the
//! hidden `worker` directive) becomes the sandboxed WORKER-mode child.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use clap::Parser;

use bulkyard::cli::{exit_code, Cli, Directive};
use bulkyard::config::Config;
use bulkyard::core::flags::WorkerState;
use bulkyard::core::pkg::PkgIndex;
use bulkyard::crcdb::CrcDb;
use bulkyard::ops::graph_load::{self, GraphLoadConfig, MakeDescribeSource};
use bulkyard::ops::hooks::{HookEvent, HookPkgContext, RunTotals};
use bulkyard::ops::worker_child::{self, WorkerContext};
use bulkyard::ops::worker_slot::{self, SandboxPaths, WorkerOutcome};
use bulkyard::ops::{dynamic, repo, scheduler};
use bulkyard::sandbox::Template;
use bulkyard::stats::{LogSink, MonitorSink, StatsChain, StatsSink, Totals};

/// Flags packed into the `worker` directive's integer argument, distinct
/// from `PkgFlags`: this is the small amount of run-mode context the
/// master passes across exec rather than re-deriving from config alone.
mod worker_flags {
    pub const DEBUGSTOP: u32 = 1 << 0;
    pub const DEVELOPER_MODE: u32 = 1 << 1;
    pub const INSTALL_DEPS_REQUIRED: u32 = 1 << 2;
}

fn main() {
    let cli = Cli::parse();
    let code = match &cli.directive {
        Directive::Worker { slot, fd, portdir, pkgfile, flags } => {
            run_worker(&cli, *slot, *fd, portdir.clone(), pkgfile.clone(), *flags)
        }
        Directive::Version => {
            println!("bulkyard {}", env!("CARGO_PKG_VERSION"));
            exit_code::SUCCESS
        }
        _ => run_operator_directive(&cli),
    };
    std::process::exit(code);
}

fn default_config_path() -> PathBuf {
    for candidate in ["/etc/bulkyard/bulkyard.ini", "/usr/local/etc/bulkyard/bulkyard.ini"] {
        if Path::new(candidate).is_file() {
            return PathBuf::from(candidate);
        }
    }
    PathBuf::from("/usr/local/etc/bulkyard/bulkyard.ini")
}

fn load_config(cli: &Cli) -> Result<Config, i32> {
    let path = cli.config.clone().unwrap_or_else(default_config_path);
    match Config::load(&path, "default") {
        Ok(cfg) => Ok(cfg),
        Err(e) => {
            eprintln!("bulkyard: {e}");
            Err(exit_code::FATAL)
        }
    }
}

fn run_worker(_cli: &Cli, slot: u32, fd: i32, portdir: String, pkgfile: String, flags: u32) -> i32 {
    // Worker mode doesn't go through `load_config`'s error path: a config
    // failure here means the master itself is misconfigured, which is a
    // fatal condition with no graceful degradation.
    let cfg = match Config::load(&default_config_path(), "default") {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("bulkyard(worker): {e}");
            return exit_code::FATAL;
        }
    };

    let (base, flavor) = bulkyard::core::pkg::Pkg::split_flavor(&portdir);
    let _ = base;
    let ctx = WorkerContext {
        slot,
        portdir: portdir.clone(),
        pkgfile,
        basedir: cfg.build_base.join(format!("Slot{slot:03}")),
        repo_dir: cfg.packages_path.clone(),
        make_conf: cfg.make_conf.clone(),
        flavor: flavor.map(str::to_owned),
        make_jobs_number: None,
        developer_mode: flags & worker_flags::DEVELOPER_MODE != 0,
        debugstop: flags & worker_flags::DEBUGSTOP != 0,
        install_deps_required: flags & worker_flags::INSTALL_DEPS_REQUIRED != 0,
    };

    worker_child::run(ctx, fd as RawFd)
}

fn run_operator_directive(cli: &Cli) -> i32 {
    let cfg = match load_config(cli) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };

    if let Err(e) = bulkyard::log::init(&cfg.logs_path, cli.debug) {
        eprintln!("bulkyard: failed to initialize logging: {e}");
        return exit_code::FATAL;
    }

    match &cli.directive {
        Directive::Configure => {
            println!("configuration OK for profile `{}`", cfg.profile);
            exit_code::SUCCESS
        }
        Directive::PrepareSystem => run_prepare_system(&cfg),
        Directive::RebuildRepository => run_rebuild_repository(&cfg),
        Directive::PurgeDistfiles => run_purge_distfiles(cli, &cfg),
        Directive::Cleanup => run_cleanup(&cfg),
        Directive::Status { ports } => run_status(&cfg, ports.clone()),
        Directive::StatusEverything => run_status(&cfg, Vec::new()),
        Directive::Force { ports } => run_force(cli, &cfg, ports),
        Directive::Build { ports } | Directive::JustBuild { ports } | Directive::Install { ports } | Directive::Test { ports } => {
            run_build(cli, &cfg, ports, directive_flags(&cli.directive, cli.debug))
        }
        Directive::UpgradeSystem | Directive::Everything => run_build(cli, &cfg, &[], directive_flags(&cli.directive, cli.debug)),
        Directive::Worker { .. } | Directive::Version => unreachable!("handled in main"),
    }
}

/// Flags to pass through to the scheduler/worker for this directive;
/// `JustBuild` never installs into the sandbox, `Install` always does.
/// `-d`/`--debug` at the CLI sets DEBUGSTOP, freezing a worker's sandbox
/// in place on success instead of tearing it down, per §4.5/§4.6.
fn directive_flags(d: &Directive, debug: bool) -> u32 {
    let mut flags = match d {
        Directive::Install { .. } => worker_flags::INSTALL_DEPS_REQUIRED,
        _ => 0,
    };
    if debug {
        flags |= worker_flags::DEBUGSTOP;
    }
    flags
}

/// `bulkyard force` deletes the existing artifact for every requested
/// port before running the ordinary build loop, so a node that's already
/// `PACKAGED` gets rebuilt instead of short-circuiting as `SUCCESS`.
fn run_force(cli: &Cli, cfg: &Config, ports: &[String]) -> i32 {
    let crcdb = match open_crcdb(cfg) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("bulkyard: {e}");
            return exit_code::FATAL;
        }
    };
    let mut graph = match load_graph_for(cfg, &crcdb, ports) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("bulkyard: {e}");
            return exit_code::FATAL;
        }
    };
    let roots = graph.roots.clone();
    let removed = repo::remove_packages(cfg, &mut graph, &roots);
    for path in &removed {
        tracing::info!(path = %path.display(), "force: removed existing artifact");
    }
    run_build(cli, cfg, ports, directive_flags(&cli.directive, cli.debug))
}

fn run_prepare_system(cfg: &Config) -> i32 {
    let host_root = Path::new("/");
    let tpl = Template::new(&cfg.build_base);
    if tpl.needs_rebuild(host_root, false) {
        if let Err(e) = tpl.rebuild(host_root) {
            eprintln!("bulkyard: sandbox template rebuild failed: {e}");
            return exit_code::FATAL;
        }
    }
    for slot in 0..cfg.max_workers {
        if let Err(e) = tpl.materialize_worker_copies(slot) {
            eprintln!("bulkyard: per-worker template copy failed: {e}");
            return exit_code::FATAL;
        }
    }
    println!("sandbox template ready under {}", tpl.root.display());
    exit_code::SUCCESS
}

fn run_cleanup(cfg: &Config) -> i32 {
    let tpl = Template::new(&cfg.build_base);
    if tpl.root.is_dir() {
        if let Err(e) = std::fs::remove_dir_all(&tpl.root) {
            eprintln!("bulkyard: cleanup failed: {e}");
            return exit_code::FATAL;
        }
    }
    println!("removed sandbox template and per-worker scratch");
    exit_code::SUCCESS
}

fn run_rebuild_repository(cfg: &Config) -> i32 {
    let pkg_static = cfg.build_base.join("Template/usr/local/sbin/pkg-static");
    match repo::rebuild_repository(cfg, &pkg_static, repo::PkgSuffix::Txz) {
        Ok(()) => {
            println!("rebuild succeeded");
            exit_code::SUCCESS
        }
        Err(e) => {
            eprintln!("bulkyard: rebuild failed: {e}");
            exit_code::FATAL
        }
    }
}

fn run_purge_distfiles(cli: &Cli, cfg: &Config) -> i32 {
    let crcdb = match open_crcdb(cfg) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("bulkyard: {e}");
            return exit_code::FATAL;
        }
    };
    let graph = match load_graph_for(cfg, &crcdb, &[]) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("bulkyard: {e}");
            return exit_code::FATAL;
        }
    };

    let obsolete = match repo::find_obsolete_distfiles(cfg, &graph) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("bulkyard: {e}");
            return exit_code::FATAL;
        }
    };

    if obsolete.is_empty() {
        println!("no obsolete distfiles found");
        return exit_code::SUCCESS;
    }

    println!("{} obsolete distfile(s) found", obsolete.len());
    if !cli.assume_yes && !confirm("Delete them? ") {
        return exit_code::SUCCESS;
    }
    for rel in &obsolete {
        let path = cfg.distfiles_path.join(rel);
        match std::fs::remove_file(&path) {
            Ok(()) => println!("deleted {}", path.display()),
            Err(e) => eprintln!("cannot delete {}: {e}", path.display()),
        }
    }
    exit_code::SUCCESS
}

fn confirm(prompt: &str) -> bool {
    use std::io::Write;
    print!("{prompt}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn run_status(cfg: &Config, ports: Vec<String>) -> i32 {
    let crcdb = match open_crcdb(cfg) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("bulkyard: {e}");
            return exit_code::FATAL;
        }
    };
    let graph = match load_graph_for(cfg, &crcdb, &ports) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("bulkyard: {e}");
            return exit_code::FATAL;
        }
    };

    let mut packaged = 0;
    let mut other = 0;
    for (_, pkg) in graph.iter() {
        if pkg.flags.contains(bulkyard::core::PkgFlags::PACKAGED) {
            packaged += 1;
        } else {
            other += 1;
        }
    }
    println!("{} node(s): {packaged} packaged, {other} not yet built", graph.len());
    exit_code::SUCCESS
}

fn open_crcdb(cfg: &Config) -> anyhow::Result<CrcDb> {
    CrcDb::open(&cfg.build_base.join("crc.db"))
}

fn load_graph_for(cfg: &Config, crcdb: &CrcDb, ports: &[String]) -> anyhow::Result<bulkyard::core::Graph> {
    let source: Arc<dyn graph_load::PortMetadataSource + Send + Sync> =
        Arc::new(MakeDescribeSource::new(cfg.ports_path.clone()));
    let load_cfg = GraphLoadConfig {
        ports_path: cfg.ports_path.clone(),
        repo_dir: cfg.packages_path.clone(),
        bulk_jobs: cfg.max_bulk as usize,
        override_pkg_delete: cfg.override_pkg_delete,
    };
    Ok(graph_load::load_graph(ports, source, crcdb, &load_cfg)?)
}

/// Split the loaded graph into the §8.3 accounting buckets: `total` is
/// every non-DUMMY, non-META node (the set `success+failed+skipped+
/// ignored+missing` must sum to), `missing` the NOTFOUND subset of it,
/// and `meta` the DUMMY/META nodes excluded from `total` entirely.
fn count_graph_totals(graph: &bulkyard::core::Graph) -> (u32, u32, u32) {
    let mut total = 0u32;
    let mut missing = 0u32;
    let mut meta = 0u32;
    for (_, pkg) in graph.iter() {
        if pkg.flags.intersects(bulkyard::core::PkgFlags::DUMMY | bulkyard::core::PkgFlags::META) {
            meta += 1;
            continue;
        }
        total += 1;
        if pkg.flags.contains(bulkyard::core::PkgFlags::NOTFOUND) {
            missing += 1;
        }
    }
    (total, missing, meta)
}

/// One slot assignment handed from the scheduler loop to a slot thread.
struct SlotJob {
    pkg_idx: PkgIndex,
    portdir: String,
    pkgfile: String,
    flags: u32,
    pkg_dep_size: u64,
}

/// Events a slot thread reports back to the scheduler loop, so every
/// `StatsSink` call and every graph mutation happens on one thread.
enum SlotEvent {
    StatusUpdate { slot: usize, portdir: String, phase: String, lines: u64 },
    StateChange { slot: usize, state: &'static str },
    Finished { slot: usize, pkg_idx: PkgIndex, outcome: WorkerOutcome },
}

/// Forwards the two per-slot [`StatsSink`] calls [`worker_slot::drive_slot`]
/// makes straight across a channel to the scheduler loop.
struct ChannelStats {
    tx: mpsc::Sender<SlotEvent>,
}

impl StatsSink for ChannelStats {
    fn on_status_update(&mut self, slot: usize, portdir: &str, phase: &str, lines: u64) {
        let _ = self.tx.send(SlotEvent::StatusUpdate {
            slot,
            portdir: portdir.to_owned(),
            phase: phase.to_owned(),
            lines,
        });
    }

    fn on_worker_state_change(&mut self, slot: usize, state: &str) {
        let state: &'static str = match state {
            "running" => "running",
            _ => "unknown",
        };
        let _ = self.tx.send(SlotEvent::StateChange { slot, state });
    }
}

fn run_build(cli: &Cli, cfg: &Config, ports: &[String], extra_flags: u32) -> i32 {
    let crcdb = match open_crcdb(cfg) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("bulkyard: {e}");
            return exit_code::FATAL;
        }
    };
    let mut graph = match load_graph_for(cfg, &crcdb, ports) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("bulkyard: {e}");
            return exit_code::FATAL;
        }
    };

    let exe = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("bulkyard: cannot resolve own executable path: {e}");
            return exit_code::FATAL;
        }
    };

    let mut stats = StatsChain::new();
    match LogSink::open(&cfg.logs_path) {
        Ok(sink) => stats.push(Box::new(sink)),
        Err(e) => tracing::warn!(error = %e, "failed to open log sink"),
    }
    match MonitorSink::open(&cfg.logs_path, cfg.max_workers, &cfg.ports_path, &cfg.packages_path, &cfg.profile) {
        Ok(sink) => stats.push(Box::new(sink)),
        Err(e) => tracing::warn!(error = %e, "failed to open monitor sink"),
    }

    let hook_pool = bulkyard::ops::hooks::maybe_spawn_pool(cfg);
    let (total, missing, meta) = count_graph_totals(&graph);

    let (event_tx, event_rx) = mpsc::channel::<SlotEvent>();
    let (job_txs, job_rxs): (Vec<_>, Vec<_>) = (0..cfg.max_workers)
        .map(|_| mpsc::channel::<SlotJob>())
        .collect::<Vec<_>>()
        .into_iter()
        .unzip();

    let mut dynamic_ctrl = dynamic::DynamicController::new(cfg.max_workers, cfg.pkg_dep_scale_target);
    let mut slots: Vec<WorkerState> = vec![WorkerState::Idle; cfg.max_workers as usize];
    let mut slot_pkg: Vec<Option<PkgIndex>> = vec![None; cfg.max_workers as usize];
    let mut running_pkg_dep_size: u64 = 0;
    let mut totals = Totals { total, missing, meta, ..Default::default() };
    let mut failed_workers: u32 = 0;
    let options_path = cfg.build_base.join("options");
    let mut first_pass = true;
    let mut run_start_announced = false;
    let mut dynamic_cap = cfg.max_workers;
    let run_start = std::time::Instant::now();

    std::thread::scope(|scope| {
        for (slot_index, job_rx) in job_rxs.into_iter().enumerate() {
            let exe = exe.clone();
            let event_tx = event_tx.clone();
            let basedir = cfg.build_base.join(format!("Slot{slot_index:03}"));
            let sandbox_paths = SlotSandboxConfig {
                xports: cfg.ports_path.clone(),
                distfiles: cfg.distfiles_path.clone(),
                packages: cfg.packages_path.clone(),
                options: options_path.clone(),
            };
            scope.spawn(move || {
                slot_thread_main(slot_index as u32, exe, basedir, sandbox_paths, job_rx, event_tx);
            });
        }
        drop(event_tx);

        loop {
            let result = match scheduler::run_pass(&mut graph, &cfg.packages_path, cfg.override_pkg_delete, first_pass) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("bulkyard: scheduler error: {e}");
                    break;
                }
            };
            if !run_start_announced {
                run_start_announced = true;
                let visible_total = total.saturating_sub(result.preexisting_success);
                stats.on_run_start(visible_total);
                if let Some(pool) = &hook_pool {
                    bulkyard::ops::hooks::queue_hook(
                        pool,
                        cfg,
                        HookEvent::RunStart,
                        None,
                        Some(RunTotals { queued: visible_total as u64, ..Default::default() }),
                    );
                }
            }
            first_pass = false;

            for &idx in &result.newly_ignored {
                totals.ignored += 1;
                let pkg = graph.get(idx);
                stats.on_pkg_ignored(&pkg.portdir);
                if let Some(pool) = &hook_pool {
                    bulkyard::ops::hooks::queue_hook(
                        pool,
                        cfg,
                        HookEvent::PkgIgnored,
                        Some(&HookPkgContext { portdir: pkg.portdir.clone(), pkgfile: pkg.pkgfile.clone() }),
                        None,
                    );
                }
            }
            for &idx in &result.newly_skipped {
                totals.skipped += 1;
                let pkg = graph.get(idx);
                stats.on_pkg_skipped(&pkg.portdir);
                if let Some(pool) = &hook_pool {
                    bulkyard::ops::hooks::queue_hook(
                        pool,
                        cfg,
                        HookEvent::PkgSkipped,
                        Some(&HookPkgContext { portdir: pkg.portdir.clone(), pkgfile: pkg.pkgfile.clone() }),
                        None,
                    );
                }
            }
            for &idx in &result.newly_success {
                totals.success += 1;
                let pkg = graph.get(idx);
                stats.on_pkg_success(&pkg.portdir);
            }

            let mut queue = scheduler::ReadyQueue::new(&graph, result.build_list);

            let slow_start_cap = match cli.slow_start {
                Some(secs) if secs > 0 => {
                    let frac = (run_start.elapsed().as_secs_f64() / secs as f64).min(1.0);
                    ((cfg.max_workers as f64) * frac).ceil().max(1.0) as u32
                }
                _ => cfg.max_workers,
            };
            let failure_cap = cfg.max_workers.saturating_sub(failed_workers);
            let active_slots = slow_start_cap.min(dynamic_cap).min(failure_cap) as usize;

            for slot_index in 0..active_slots.min(slots.len()) {
                if slots[slot_index] != WorkerState::Idle {
                    continue;
                }
                let Some(pkg_idx) = queue.next_for_slot(slot_index) else { continue };
                let dep_size = scheduler::pkg_dep_size(&graph, pkg_idx);
                let pkg = graph.get(pkg_idx);
                let job = SlotJob {
                    pkg_idx,
                    portdir: pkg.portdir.clone(),
                    pkgfile: pkg.pkgfile.clone(),
                    flags: extra_flags,
                    pkg_dep_size: dep_size,
                };
                slots[slot_index] = WorkerState::Pending;
                slot_pkg[slot_index] = Some(pkg_idx);
                running_pkg_dep_size += dep_size;
                let _ = job_txs[slot_index].send(job);
            }

            if queue.is_empty() && slots.iter().all(|s| *s == WorkerState::Idle) {
                break;
            }

            let sample = dynamic_ctrl.sample();
            dynamic_cap = dynamic_ctrl.tick(std::time::Instant::now(), sample, running_pkg_dep_size);

            match event_rx.recv_timeout(dynamic::TICK_INTERVAL) {
                Ok(event) => {
                    handle_slot_event(event, cfg, &mut graph, &mut slots, &mut slot_pkg, &mut totals, &mut stats, &hook_pool, &mut running_pkg_dep_size, &mut failed_workers);
                    // Drain any further events already queued before
                    // looping back into another scheduling pass.
                    while let Ok(event) = event_rx.try_recv() {
                        handle_slot_event(event, cfg, &mut graph, &mut slots, &mut slot_pkg, &mut totals, &mut stats, &hook_pool, &mut running_pkg_dep_size, &mut failed_workers);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        drop(job_txs);
    });

    stats.on_run_end(&totals);
    if let Some(pool) = hook_pool {
        bulkyard::ops::hooks::queue_hook(
            &pool,
            cfg,
            HookEvent::RunEnd,
            None,
            Some(RunTotals {
                queued: total as u64,
                built: totals.success as u64,
                failed: totals.failed as u64,
                ignored: totals.ignored as u64,
                skipped: totals.skipped as u64,
            }),
        );
        pool.done();
    }
    if totals.failed > 0 {
        exit_code::FATAL
    } else {
        exit_code::SUCCESS
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_slot_event(
    event: SlotEvent,
    cfg: &Config,
    graph: &mut bulkyard::core::Graph,
    slots: &mut [WorkerState],
    slot_pkg: &mut [Option<PkgIndex>],
    totals: &mut Totals,
    stats: &mut StatsChain,
    hook_pool: &Option<bulkyard::core::bulk::BulkPool>,
    running_pkg_dep_size: &mut u64,
    failed_workers: &mut u32,
) {
    match event {
        SlotEvent::StatusUpdate { slot, portdir, phase, lines } => {
            stats.on_status_update(slot, &portdir, &phase, lines);
        }
        SlotEvent::StateChange { slot, state } => {
            stats.on_worker_state_change(slot, state);
        }
        SlotEvent::Finished { slot, pkg_idx, outcome } => {
            let portdir = graph.get(pkg_idx).portdir.clone();
            let pkgfile = graph.get(pkg_idx).pkgfile.clone();
            match outcome {
                WorkerOutcome::Success => {
                    graph.get_mut(pkg_idx).flags.insert(bulkyard::core::PkgFlags::PACKAGED);
                    graph.get_mut(pkg_idx).flags.insert(bulkyard::core::PkgFlags::SUCCESS);
                    if let Some(pool) = hook_pool {
                        bulkyard::ops::hooks::queue_hook(
                            pool,
                            cfg,
                            HookEvent::PkgSuccess,
                            Some(&HookPkgContext { portdir: portdir.clone(), pkgfile }),
                            None,
                        );
                    }
                    stats.on_pkg_success(&portdir);
                    totals.success += 1;
                    slots[slot] = WorkerState::Idle;
                }
                WorkerOutcome::Frozen => {
                    // DEBUGSTOP: the sandbox is left mounted for inspection
                    // and the slot never returns to Idle on its own.
                    graph.get_mut(pkg_idx).flags.insert(bulkyard::core::PkgFlags::PACKAGED);
                    graph.get_mut(pkg_idx).flags.insert(bulkyard::core::PkgFlags::SUCCESS);
                    if let Some(pool) = hook_pool {
                        bulkyard::ops::hooks::queue_hook(
                            pool,
                            cfg,
                            HookEvent::PkgSuccess,
                            Some(&HookPkgContext { portdir: portdir.clone(), pkgfile }),
                            None,
                        );
                    }
                    stats.on_pkg_success(&portdir);
                    totals.success += 1;
                    slots[slot] = WorkerState::Frozen;
                    return;
                }
                WorkerOutcome::Failure => {
                    graph.get_mut(pkg_idx).flags.insert(bulkyard::core::PkgFlags::FAILURE);
                    if let Some(pool) = hook_pool {
                        bulkyard::ops::hooks::queue_hook(
                            pool,
                            cfg,
                            HookEvent::PkgFailure,
                            Some(&HookPkgContext { portdir: portdir.clone(), pkgfile }),
                            None,
                        );
                    }
                    stats.on_pkg_failure(&portdir);
                    totals.failed += 1;
                    slots[slot] = WorkerState::Idle;
                }
                WorkerOutcome::Failed => {
                    graph.get_mut(pkg_idx).flags.insert(bulkyard::core::PkgFlags::FAILURE);
                    if let Some(pool) = hook_pool {
                        bulkyard::ops::hooks::queue_hook(
                            pool,
                            cfg,
                            HookEvent::PkgFailure,
                            Some(&HookPkgContext { portdir: portdir.clone(), pkgfile }),
                            None,
                        );
                    }
                    stats.on_pkg_failure(&portdir);
                    totals.failed += 1;
                    *failed_workers += 1;
                    slots[slot] = WorkerState::Idle;
                }
            }
            if let Some(idx) = slot_pkg[slot].take() {
                *running_pkg_dep_size = running_pkg_dep_size.saturating_sub(scheduler::pkg_dep_size(graph, idx));
            }
        }
    }
}

/// Owned form of [`SandboxPaths`] so it can be moved into a slot's worker
/// thread; the thread borrows from it for each job it drives.
struct SlotSandboxConfig {
    xports: PathBuf,
    distfiles: PathBuf,
    packages: PathBuf,
    options: PathBuf,
}

fn slot_thread_main(
    slot: u32,
    exe: PathBuf,
    basedir: PathBuf,
    sandbox_cfg: SlotSandboxConfig,
    job_rx: mpsc::Receiver<SlotJob>,
    event_tx: mpsc::Sender<SlotEvent>,
) {
    let host_root = Path::new("/");

    for job in job_rx {
        let debugstop = job.flags & worker_flags::DEBUGSTOP != 0;
        let mut wslot = bulkyard::core::WorkerSlot::new(slot as usize, basedir.clone());

        let paths = SandboxPaths {
            host_root,
            xports: &sandbox_cfg.xports,
            distfiles: &sandbox_cfg.distfiles,
            packages: &sandbox_cfg.packages,
            options: &sandbox_cfg.options,
        };
        let (applied, mount_result) = worker_slot::prepare_slot_sandbox(&basedir, slot, &paths);
        if let Err(e) = mount_result {
            tracing::error!(slot, error = %e, "sandbox assembly failed");
            let _ = event_tx.send(SlotEvent::Finished { slot: slot as usize, pkg_idx: job.pkg_idx, outcome: WorkerOutcome::Failed });
            worker_slot::teardown_slot_sandbox(&applied);
            continue;
        }

        let (mut child, mut master_end) = match worker_slot::spawn_worker_child(
            &exe,
            slot,
            &job.portdir,
            &job.pkgfile,
            job.flags,
            &basedir,
        ) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(slot, error = %e, "failed to spawn worker child");
                let _ = event_tx.send(SlotEvent::Finished { slot: slot as usize, pkg_idx: job.pkg_idx, outcome: WorkerOutcome::Failed });
                if !debugstop {
                    worker_slot::teardown_slot_sandbox(&applied);
                }
                continue;
            }
        };

        let mut forwarder = ChannelStats { tx: event_tx.clone() };
        let install_deps_required = job.flags & worker_flags::INSTALL_DEPS_REQUIRED != 0;
        let outcome = worker_slot::drive_slot(&mut wslot, &job.portdir, &mut master_end, &mut forwarder, install_deps_required);
        let _ = child.wait();

        if !debugstop {
            worker_slot::teardown_slot_sandbox(&applied);
        }

        let _ = event_tx.send(SlotEvent::Finished { slot: slot as usize, pkg_idx: job.pkg_idx, outcome });
    }
}
