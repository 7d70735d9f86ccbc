//! Configuration: the `.ini`-style file (`[Global]` plus named profile
//! sections) and the sibling `<Profile>-make.conf` key=value variable
//! file.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct Config {
    pub profile: String,
    pub ports_path: PathBuf,
    pub distfiles_path: PathBuf,
    pub packages_path: PathBuf,
    pub logs_path: PathBuf,
    pub build_base: PathBuf,
    pub max_workers: u32,
    pub max_bulk: u32,
    pub pkg_dep_scale_target: u64,
    pub swap_cap_floor_pct: u32,
    pub load_cap_ncpu_multiplier: f64,
    pub override_pkg_delete: bool,
    pub use_ccache: bool,
    pub ccache_path: Option<PathBuf>,
    pub leverage_prebuilt: bool,
    pub make_conf: HashMap<String, String>,
    pub hooks: HookPaths,
}

/// Paths to the hook scripts discovered under the config directory, per
/// `hook_<id>` naming. Each field is `Some` only if the file exists and
/// is executable; hooks are opt-in per event, not all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct HookPaths {
    pub run_start: Option<PathBuf>,
    pub run_end: Option<PathBuf>,
    pub pkg_success: Option<PathBuf>,
    pub pkg_failure: Option<PathBuf>,
    pub pkg_ignored: Option<PathBuf>,
    pub pkg_skipped: Option<PathBuf>,
}

impl HookPaths {
    pub fn any_configured(&self) -> bool {
        self.run_start.is_some()
            || self.run_end.is_some()
            || self.pkg_success.is_some()
            || self.pkg_failure.is_some()
            || self.pkg_ignored.is_some()
            || self.pkg_skipped.is_some()
    }

    fn discover(config_dir: &Path) -> Self {
        let check = |name: &str| -> Option<PathBuf> {
            let path = config_dir.join(name);
            let executable = std::fs::metadata(&path)
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false);
            executable.then_some(path)
        };
        Self {
            run_start: check("hook_run_start"),
            run_end: check("hook_run_end"),
            pkg_success: check("hook_pkg_success"),
            pkg_failure: check("hook_pkg_failure"),
            pkg_ignored: check("hook_pkg_ignored"),
            pkg_skipped: check("hook_pkg_skipped"),
        }
    }
}

impl Config {
    /// Load `path`, apply the named profile's overrides on top of
    /// `[Global]`, read the sibling `<profile>-make.conf`, and validate
    /// every required path exists. All validation failures are collected
    /// and reported together rather than abort-on-first.
    pub fn load(path: &Path, profile: &str) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let ini = ini::Ini::load_from_file(path).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: anyhow::anyhow!(e),
        })?;

        let global = ini.section(Some("Global"));
        let prof = ini.section(Some(profile));

        let get = |key: &str| -> Option<String> {
            prof.and_then(|s| s.get(key))
                .or_else(|| global.and_then(|s| s.get(key)))
                .map(str::to_owned)
        };
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_owned());

        let mut problems = Vec::new();
        let require = |key: &str, problems: &mut Vec<String>| -> PathBuf {
            match get(key) {
                Some(v) => PathBuf::from(v),
                None => {
                    problems.push(format!("missing required key `{key}`"));
                    PathBuf::new()
                }
            }
        };

        let ports_path = require("Ports", &mut problems);
        let distfiles_path = require("Distfiles", &mut problems);
        let packages_path = require("Packages", &mut problems);
        let logs_path = require("LogsPath", &mut problems);
        let build_base = require("BuildBase", &mut problems);

        for (key, p) in [
            ("Ports", &ports_path),
            ("Distfiles", &distfiles_path),
            ("Packages", &packages_path),
            ("LogsPath", &logs_path),
            ("BuildBase", &build_base),
        ] {
            if !p.as_os_str().is_empty() && !p.is_dir() {
                problems.push(format!("`{key}` path {} is not a directory", p.display()));
            }
        }

        let leverage_prebuilt = parse_bool(&get_or("LeveragePrebuilt", "no"));
        if leverage_prebuilt {
            problems.push(
                "LeveragePrebuilt=true is not supported; the semantics of a future \
                 true value are undefined"
                    .to_owned(),
            );
        }

        let max_workers: u32 = get_or("MaxWorkers", "4")
            .parse()
            .map_err(|_| ())
            .unwrap_or_else(|()| {
                problems.push("MaxWorkers must be a positive integer".to_owned());
                4
            });

        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        let make_conf_path = path.with_file_name(format!("{profile}-make.conf"));
        let make_conf = if make_conf_path.exists() {
            parse_make_conf(&make_conf_path).map_err(|source| ConfigError::Parse {
                path: make_conf_path,
                source,
            })?
        } else {
            HashMap::new()
        };

        Ok(Config {
            profile: profile.to_owned(),
            ports_path,
            distfiles_path,
            packages_path,
            logs_path,
            build_base,
            max_workers,
            max_bulk: get_or("MaxBulk", "4").parse().unwrap_or(4),
            pkg_dep_scale_target: get_or("PkgDepScaleTarget", "0").parse().unwrap_or(0),
            swap_cap_floor_pct: get_or("SwapCapFloorPct", "25").parse().unwrap_or(25),
            load_cap_ncpu_multiplier: get_or("LoadCapMultiplier", "1.5").parse().unwrap_or(1.5),
            override_pkg_delete: parse_bool(&get_or("OverridePkgDelete", "no")),
            use_ccache: parse_bool(&get_or("UseCCache", "no")),
            ccache_path: get("CCachePath").map(PathBuf::from),
            leverage_prebuilt,
            make_conf,
            hooks: HookPaths::discover(path.parent().unwrap_or_else(|| Path::new("."))),
        })
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_make_conf(path: &Path) -> Result<HashMap<String, String>, anyhow::Error> {
    let text = std::fs::read_to_string(path)?;
    let mut vars = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            vars.insert(key.trim().to_owned(), value.trim().trim_matches('"').to_owned());
        }
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_layout(dir: &Path) -> PathBuf {
        for sub in ["ports", "distfiles", "packages", "logs", "build"] {
            std::fs::create_dir_all(dir.join(sub)).unwrap();
        }
        let ini_path = dir.join("bulkyard.ini");
        let mut f = std::fs::File::create(&ini_path).unwrap();
        writeln!(
            f,
            "[Global]\nPorts={p}/ports\nDistfiles={p}/distfiles\nPackages={p}/packages\nLogsPath={p}/logs\nBuildBase={p}/build\nMaxWorkers=8\n\n[default]\n",
            p = dir.display()
        )
        .unwrap();
        ini_path
    }

    #[test]
    fn loads_a_well_formed_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_layout(dir.path());

        let cfg = Config::load(&path, "default").unwrap();
        assert_eq!(cfg.max_workers, 8);
        assert!(!cfg.leverage_prebuilt);
        assert!(!cfg.hooks.any_configured());
    }

    #[test]
    fn executable_hook_scripts_are_discovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_layout(dir.path());

        let hook_path = dir.path().join("hook_pkg_success");
        std::fs::write(&hook_path, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = std::fs::metadata(&hook_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&hook_path, perms).unwrap();

        let cfg = Config::load(&path, "default").unwrap();
        assert_eq!(cfg.hooks.pkg_success, Some(hook_path));
        assert!(cfg.hooks.pkg_failure.is_none());
    }

    #[test]
    fn missing_required_paths_are_all_reported_together() {
        let dir = tempfile::tempdir().unwrap();
        let ini_path = dir.path().join("bulkyard.ini");
        std::fs::write(&ini_path, "[Global]\n[default]\n").unwrap();

        let err = Config::load(&ini_path, "default").unwrap_err();
        match err {
            ConfigError::Invalid(problems) => assert_eq!(problems.len(), 5),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn leverage_prebuilt_true_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_layout(dir.path());
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("LeveragePrebuilt=yes\n");
        std::fs::write(&path, text).unwrap();

        let err = Config::load(&path, "default").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
