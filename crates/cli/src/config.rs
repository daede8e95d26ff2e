//! Runtime configuration.
//!
//! A small TOML file can preset the diagnostic switches so they do not have
//! to be passed on every invocation:
//!
//! ```toml
//! trace-execution = false
//! print-code = true
//! stress-gc = false
//! log-gc = false
//! extended-falseness = false
//! ```
//!
//! CLI flags OR into whatever the file sets.

use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub trace_execution: bool,
    pub print_code: bool,
    pub stress_gc: bool,
    pub log_gc: bool,
    pub extended_falseness: bool,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Config, String> {
        toml::from_str(content).map_err(|error| error.to_string())
    }

    /// Loads the file when a path is given; defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Config, String> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .map_err(|error| format!("could not read {}: {}", path.display(), error))?;
                Config::from_toml(&content)
            }
            None => Ok(Config::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_all_off() {
        let config = Config::default();
        assert!(!config.trace_execution);
        assert!(!config.print_code);
        assert!(!config.stress_gc);
        assert!(!config.log_gc);
        assert!(!config.extended_falseness);
    }

    #[test]
    fn test_from_toml() {
        let config =
            Config::from_toml("print-code = true\nstress-gc = true\nlog-gc = true\n").unwrap();
        assert!(config.print_code);
        assert!(config.stress_gc);
        assert!(config.log_gc);
        assert!(!config.trace_execution);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(Config::from_toml("no-such-switch = true\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lox.toml");
        fs::write(&path, "extended-falseness = true\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert!(config.extended_falseness);
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
        assert!(!Config::load(None).unwrap().stress_gc);
    }
}
