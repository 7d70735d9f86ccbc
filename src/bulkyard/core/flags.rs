//! Bitset flags and small enums shared by the package graph and scheduler.
//!
//! `PkgFlags` mirrors the original's `PKGF_*` bitfield: a handful of these
//! bits are mutually exclusive over a node's "terminal state" (see
//! [`PkgFlags::is_terminal`]), but they're still modeled as one bitset
//! because several non-terminal bits (DUMMY, MANUALSEL, DEBUGSTOP) persist
//! independently of it.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PkgFlags: u32 {
        const PACKAGED     = 1 << 0;
        const DUMMY        = 1 << 1;
        const NOTFOUND     = 1 << 2;
        const CORRUPT      = 1 << 3;
        const PLACEHOLD    = 1 << 4;
        const BUILDLIST    = 1 << 5;
        const BUILDLOOP    = 1 << 6;
        const BUILDTRAV    = 1 << 7;
        const NOBUILD_DEP    = 1 << 8;
        const NOBUILD_SELECT = 1 << 9;
        const NOBUILD_FAILED = 1 << 10;
        const NOBUILD_IGNORE = 1 << 11;
        const SUCCESS      = 1 << 12;
        const FAILURE      = 1 << 13;
        const RUNNING      = 1 << 14;
        const PKGPKG       = 1 << 15;
        const NOTREADY     = 1 << 16;
        const MANUALSEL    = 1 << 17;
        const META         = 1 << 18;
        const DEBUGSTOP    = 1 << 19;

        const NOBUILD_ANY = Self::NOBUILD_DEP.bits()
            | Self::NOBUILD_SELECT.bits()
            | Self::NOBUILD_FAILED.bits()
            | Self::NOBUILD_IGNORE.bits();
        const TERMINAL_ANY = Self::SUCCESS.bits()
            | Self::FAILURE.bits()
            | Self::NOBUILD_ANY.bits();
    }
}

impl PkgFlags {
    pub fn is_terminal(self) -> bool {
        self.intersects(Self::TERMINAL_ANY)
    }
}

/// Dependency edge kind, matching the six dependency-string categories a
/// port can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepKind {
    Fetch,
    Extract,
    Patch,
    Build,
    Lib,
    Run,
}

impl DepKind {
    pub const ALL: [DepKind; 6] = [
        DepKind::Fetch,
        DepKind::Extract,
        DepKind::Patch,
        DepKind::Build,
        DepKind::Lib,
        DepKind::Run,
    ];

    /// Whether this edge contributes to the estimated scratch footprint of
    /// an install-deps step (run and lib dependencies only).
    pub fn counts_toward_install_size(self) -> bool {
        matches!(self, DepKind::Run | DepKind::Lib)
    }

    pub fn tag(self) -> &'static str {
        match self {
            DepKind::Fetch => "fetch",
            DepKind::Extract => "extract",
            DepKind::Patch => "patch",
            DepKind::Build => "build",
            DepKind::Lib => "lib",
            DepKind::Run => "run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    None,
    Idle,
    Pending,
    Running,
    Done,
    Failed,
    Frozen,
    Exiting,
}

/// The fixed build pipeline, in execution order, with the nominal watchdog
/// tier (`WDOG1..WDOG9`) each phase runs under. Tiers are expressed in
/// minutes and scaled live by the dynamic controller (see
/// `ops::worker_child::watchdog_timeout`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DumpEnv,
    ShowConfig,
    DumpConfigureEnv,
    DumpConfigureArgs,
    DumpMakeEnv,
    DumpMakeArgs,
    DumpPlistSub,
    DumpSubList,
    DumpMakeConf,
    InstallPkgs,
    CheckSanity,
    PkgDepends,
    FetchDepends,
    Fetch,
    Checksum,
    ExtractDepends,
    Extract,
    PatchDepends,
    Patch,
    BuildDepends,
    LibDepends,
    Configure,
    Build,
    RunDepends,
    Stage,
    CheckPlist,
    Package,
    Install,
    Deinstall,
}

impl Phase {
    /// Nominal per-phase watchdog budget in minutes (`WDOG1..WDOG9` from
    /// the original are 5, 10, 15, 30, 60, 90, 120, 150, 180).
    pub fn nominal_minutes(self) -> u32 {
        use Phase::*;
        match self {
            DumpEnv | ShowConfig | DumpConfigureEnv | DumpConfigureArgs | DumpMakeEnv
            | DumpMakeArgs | DumpPlistSub | DumpSubList | DumpMakeConf | CheckSanity
            | PkgDepends | Checksum => 10, // WDOG2
            CheckPlist => 5,               // WDOG1
            ExtractDepends | Extract | PatchDepends | Patch | Configure => 15, // WDOG3
            InstallPkgs => 30,              // WDOG4
            BuildDepends | LibDepends | RunDepends | Stage | Package | Install | Deinstall => 60, // WDOG5
            FetchDepends | Fetch => 120,     // WDOG7
            Build => 180,                   // WDOG9
        }
    }

    pub fn name(self) -> &'static str {
        use Phase::*;
        match self {
            DumpEnv => "Environment",
            ShowConfig => "showconfig",
            DumpConfigureEnv => "CONFIGURE_ENV",
            DumpConfigureArgs => "CONFIGURE_ARGS",
            DumpMakeEnv => "MAKE_ENV",
            DumpMakeArgs => "MAKE_ARGS",
            DumpPlistSub => "PLIST_SUB",
            DumpSubList => "SUB_LIST",
            DumpMakeConf => "/etc/make.conf",
            InstallPkgs => "install-pkgs",
            CheckSanity => "check-sanity",
            PkgDepends => "pkg-depends",
            FetchDepends => "fetch-depends",
            Fetch => "fetch",
            Checksum => "checksum",
            ExtractDepends => "extract-depends",
            Extract => "extract",
            PatchDepends => "patch-depends",
            Patch => "patch",
            BuildDepends => "build-depends",
            LibDepends => "lib-depends",
            Configure => "configure",
            Build => "build",
            RunDepends => "run-depends",
            Stage => "stage",
            CheckPlist => "check-plist",
            Package => "package",
            Install => "install",
            Deinstall => "deinstall",
        }
    }

    /// The diagnostic dump phases that run before the real pipeline in
    /// developer mode.
    pub const DEVELOPER_DUMPS: [Phase; 9] = [
        Phase::DumpEnv,
        Phase::ShowConfig,
        Phase::DumpConfigureEnv,
        Phase::DumpConfigureArgs,
        Phase::DumpMakeEnv,
        Phase::DumpMakeArgs,
        Phase::DumpPlistSub,
        Phase::DumpSubList,
        Phase::DumpMakeConf,
    ];

    /// The real build pipeline, excluding the optional phases gated by
    /// run-time flags (`CheckPlist`, `Install`, `Deinstall`), which the
    /// caller splices in.
    pub const PIPELINE: [Phase; 16] = [
        Phase::InstallPkgs,
        Phase::CheckSanity,
        Phase::PkgDepends,
        Phase::FetchDepends,
        Phase::Fetch,
        Phase::Checksum,
        Phase::ExtractDepends,
        Phase::Extract,
        Phase::PatchDepends,
        Phase::Patch,
        Phase::BuildDepends,
        Phase::LibDepends,
        Phase::Configure,
        Phase::Build,
        Phase::RunDepends,
        Phase::Stage,
    ];

    /// Every phase in a stable order, used only to give each phase a
    /// small integer identity for the IPC wire record (`phase: i32`),
    /// which carries no enum discriminant of its own.
    pub const ALL: [Phase; 29] = [
        Phase::DumpEnv,
        Phase::ShowConfig,
        Phase::DumpConfigureEnv,
        Phase::DumpConfigureArgs,
        Phase::DumpMakeEnv,
        Phase::DumpMakeArgs,
        Phase::DumpPlistSub,
        Phase::DumpSubList,
        Phase::DumpMakeConf,
        Phase::InstallPkgs,
        Phase::CheckSanity,
        Phase::PkgDepends,
        Phase::FetchDepends,
        Phase::Fetch,
        Phase::Checksum,
        Phase::ExtractDepends,
        Phase::Extract,
        Phase::PatchDepends,
        Phase::Patch,
        Phase::BuildDepends,
        Phase::LibDepends,
        Phase::Configure,
        Phase::Build,
        Phase::RunDepends,
        Phase::Stage,
        Phase::CheckPlist,
        Phase::Package,
        Phase::Install,
        Phase::Deinstall,
    ];

    pub fn to_index(self) -> i32 {
        Self::ALL.iter().position(|&p| p == self).unwrap_or(0) as i32
    }

    pub fn from_index(idx: i32) -> Option<Self> {
        Self::ALL.get(idx as usize).copied()
    }
}
