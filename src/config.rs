use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 750;

/// Named constants from spec §4.G, collected here so `.satori.json` can
/// override any of them without scattering magic numbers through the search
/// pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchTuning {
    pub max_candidates: usize,
    pub rrf_k: u32,
    pub must_retry_rounds: u32,
    pub must_retry_multiplier: u32,
    pub noise_hint_top_k: usize,
    pub noise_hint_threshold: f64,
    pub changed_first_max_changed_files: usize,
    pub rerank_top_k: usize,
    pub rerank_rrf_k: u32,
    pub diversity_max_per_file: usize,
    pub diversity_relaxed_max_per_file: usize,
    pub diversity_max_per_symbol: usize,
    pub gitignore_force_reload_every_n: u32,
}

impl Default for SearchTuning {
    fn default() -> Self {
        SearchTuning {
            max_candidates: 80,
            rrf_k: 60,
            must_retry_rounds: 2,
            must_retry_multiplier: 2,
            noise_hint_top_k: 5,
            noise_hint_threshold: 0.60,
            changed_first_max_changed_files: 50,
            rerank_top_k: 50,
            rerank_rrf_k: 10,
            diversity_max_per_file: 2,
            diversity_relaxed_max_per_file: 3,
            diversity_max_per_symbol: 1,
            gitignore_force_reload_every_n: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessTuning {
    pub fresh_threshold_ms: u64,
    pub aging_threshold_ms: u64,
    pub check_debounce_ms: u64,
}

impl Default for FreshnessTuning {
    fn default() -> Self {
        FreshnessTuning {
            fresh_threshold_ms: 30 * 60 * 1000,
            aging_threshold_ms: 24 * 60 * 60 * 1000,
            check_debounce_ms: 3 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub search: SearchTuning,
    pub freshness: FreshnessTuning,
    pub enable_watcher: bool,
    pub watch_debounce_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            search: SearchTuning::default(),
            freshness: FreshnessTuning::default(),
            enable_watcher: false,
            watch_debounce_ms: DEFAULT_WATCH_DEBOUNCE_MS,
        }
    }
}

/// Loads `.satori.json` from `repo_root`, falling back to `Config::default()`
/// on a missing or malformed file, then layers in the environment-variable
/// cascade from spec §6 (`MCP_ENABLE_WATCHER`, `MCP_WATCH_DEBOUNCE_MS`).
pub fn load_config(repo_root: &Path) -> Config {
    let mut cfg = read_config_file(&repo_root.join(".satori.json")).unwrap_or_default();

    if let Ok(val) = std::env::var("MCP_ENABLE_WATCHER") {
        cfg.enable_watcher = val == "true";
    }
    if let Ok(val) = std::env::var("MCP_WATCH_DEBOUNCE_MS") {
        if let Ok(ms) = val.parse() {
            cfg.watch_debounce_ms = ms;
        }
    }

    cfg
}

fn read_config_file(path: &Path) -> Option<Config> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Guard mode resolution for the stdout guard (spec §4.J, P4):
/// `resolveGuardMode(undefined) == "drop"`,
/// `resolveGuardMode("false") == "off"`,
/// `resolveGuardMode("redirect") == "redirect"`,
/// `resolveGuardMode("off") == "off"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    Drop,
    Redirect,
    Off,
}

pub fn resolve_guard_mode(raw: Option<&str>) -> GuardMode {
    match raw {
        None => GuardMode::Drop,
        Some("false") | Some("off") => GuardMode::Off,
        Some("redirect") => GuardMode::Redirect,
        Some(_) => GuardMode::Drop,
    }
}

pub fn guard_mode_from_env() -> GuardMode {
    resolve_guard_mode(std::env::var("SATORI_CLI_STDOUT_GUARD").ok().as_deref())
}

pub fn default_context_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".context")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_mode_resolution_matches_p4() {
        assert_eq!(resolve_guard_mode(None), GuardMode::Drop);
        assert_eq!(resolve_guard_mode(Some("false")), GuardMode::Off);
        assert_eq!(resolve_guard_mode(Some("redirect")), GuardMode::Redirect);
        assert_eq!(resolve_guard_mode(Some("off")), GuardMode::Off);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = read_config_file(&dir.path().join("nope.json"));
        assert!(cfg.is_none());
    }

    #[test]
    fn malformed_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".satori.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(read_config_file(&path).is_none());
    }
}
