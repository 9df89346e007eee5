//! Configuration loading from nullweave.toml.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use nullweave_engine::{RewriteOptions, DEFAULT_EXCLUSIONS};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rewrite: RewriteConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    /// Log each rewritten unit's disassembly.
    pub trace: bool,
    /// Pass original bytes through when a unit cannot be rewritten.
    pub keep_going: bool,
    /// Unit-name prefixes never rewritten.
    pub exclude: Vec<String>,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            trace: false,
            keep_going: false,
            exclude: DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Config {
    /// Engine options from this config plus command-line overrides.
    /// Flags only ever add: `--exclude` extends the configured list.
    pub fn to_options(&self, trace: bool, extra_exclude: &[String]) -> RewriteOptions {
        let mut exclude = self.rewrite.exclude.clone();
        exclude.extend(extra_exclude.iter().cloned());
        RewriteOptions {
            trace: trace || self.rewrite.trace,
            exclude,
        }
    }
}

/// Find and load nullweave.toml, walking up from `start_dir`.
/// Returns the default config if no file is found.
pub fn load_config(start_dir: &Path) -> Config {
    match find_config_file(start_dir) {
        Some(path) => {
            let content = std::fs::read_to_string(&path).unwrap_or_default();
            toml::from_str(&content).unwrap_or_default()
        }
        None => Config::default(),
    }
}

/// Walk up directories looking for nullweave.toml.
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join("nullweave.toml");
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Default TOML content for `nullweave init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"[rewrite]
# Log each rewritten unit's disassembly (visible with debug logging).
trace = false
# Pass original bytes through when a unit cannot be rewritten.
keep_going = false
# Unit-name prefixes never rewritten.
exclude = ["core/", "std/", "sys/", "host/"]
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_toml_round_trips_to_the_defaults() {
        let cfg: Config = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        assert!(!cfg.rewrite.trace);
        assert!(!cfg.rewrite.keep_going);
        assert_eq!(cfg.rewrite.exclude, DEFAULT_EXCLUSIONS);
    }

    #[test]
    fn partial_files_fall_back_to_defaults_per_field() {
        let cfg: Config = toml::from_str("[rewrite]\ntrace = true\n").unwrap();
        assert!(cfg.rewrite.trace);
        assert!(!cfg.rewrite.keep_going);
        assert_eq!(cfg.rewrite.exclude, DEFAULT_EXCLUSIONS);
    }

    #[test]
    fn find_config_file_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nullweave.toml"), DEFAULT_CONFIG_TOML).unwrap();
        let subdir = dir.path().join("a").join("b");
        std::fs::create_dir_all(&subdir).unwrap();
        let found = find_config_file(&subdir);
        assert_eq!(found, Some(dir.path().join("nullweave.toml")));
    }

    #[test]
    fn cli_flags_extend_the_configured_exclusions() {
        let cfg = Config::default();
        let options = cfg.to_options(true, &["vendor/".to_string()]);
        assert!(options.trace);
        assert!(options.is_excluded("vendor/thing/X"));
        assert!(options.is_excluded("std/fmt/Formatter"));
    }
}
