//! Driver configuration.
//!
//! Values come from three layers, lowest precedence first: built-in
//! defaults, an optional `mrf.yml` settings file in the working directory,
//! and `MRF_*` environment variables. Command line flags are applied on top
//! by the driver entry point, so the CLI always wins.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use clap::ValueEnum;
use serde::Deserialize;
use tracing::{debug, warn};

use common::cache::CacheKind;

const SETTINGS_FILE: &str = "mrf.yml";

/// Execution backend for map and reduce tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Local,
    Lambda,
    Whisk,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local => write!(f, "local"),
            Backend::Lambda => write!(f, "lambda"),
            Backend::Whisk => write!(f, "whisk"),
        }
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Backend::Local),
            "lambda" => Ok(Backend::Lambda),
            "whisk" => Ok(Backend::Whisk),
            other => Err(anyhow::anyhow!("unknown backend {:?}", other)),
        }
    }
}

/// Process-wide driver configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Input files, directories or globs.
    pub inputs: Vec<String>,

    /// Target size of one input split, in bytes.
    pub split_size: u64,

    /// Target size of one map bin, in bytes. Must be >= `split_size`.
    pub map_bin_size: u64,

    /// Advisory size of one reduce bin, in bytes. Controls how many
    /// intermediate bins a job shuffles into.
    pub reduce_bin_size: u64,

    /// Maximum simultaneous in-flight tasks per phase.
    pub max_concurrency: usize,

    /// Base output path. Multi-stage runs append `/jobN` per stage.
    pub working_location: String,

    /// Delete intermediate data once a job completes.
    pub cleanup: bool,

    /// Execution backend.
    pub backend: Backend,

    /// Name of the deployed remote function to invoke.
    pub function_name: String,

    /// Cache layer for intermediate data.
    pub cache: CacheKind,

    /// Fail the run when any task errored, instead of only logging.
    pub fail_fast: bool,

    /// Verbose logging.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            split_size: 100 * 1024 * 1024,
            map_bin_size: 512 * 1024 * 1024,
            reduce_bin_size: 50 * 1024 * 1024,
            max_concurrency: 100,
            working_location: ".".to_string(),
            cleanup: true,
            backend: Backend::Local,
            function_name: "mrf_worker".to_string(),
            cache: CacheKind::None,
            fail_fast: false,
            verbose: false,
        }
    }
}

impl Config {
    /// Load the layered configuration: defaults, settings file, environment.
    pub fn load() -> Self {
        let mut config = Self::from_settings_file(Path::new(SETTINGS_FILE));
        config.apply_env();
        config
    }

    fn from_settings_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<Config>(&content) {
                Ok(config) => {
                    debug!("loaded settings from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("ignoring malformed settings file {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    fn apply_env(&mut self) {
        fn parsed<T: FromStr>(name: &str) -> Option<T> {
            let raw = std::env::var(name).ok()?;
            match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("ignoring unparseable {}={:?}", name, raw);
                    None
                }
            }
        }

        if let Ok(inputs) = std::env::var("MRF_INPUTS") {
            self.inputs
                .extend(inputs.split(',').map(|s| s.trim().to_string()));
        }
        if let Some(v) = parsed("MRF_SPLIT_SIZE") {
            self.split_size = v;
        }
        if let Some(v) = parsed("MRF_MAP_BIN_SIZE") {
            self.map_bin_size = v;
        }
        if let Some(v) = parsed("MRF_REDUCE_BIN_SIZE") {
            self.reduce_bin_size = v;
        }
        if let Some(v) = parsed("MRF_MAX_CONCURRENCY") {
            self.max_concurrency = v;
        }
        if let Ok(v) = std::env::var("MRF_WORKING_LOCATION") {
            self.working_location = v;
        }
        if let Some(v) = parsed("MRF_CLEANUP") {
            self.cleanup = v;
        }
        if let Some(v) = parsed("MRF_BACKEND") {
            self.backend = v;
        }
        if let Ok(v) = std::env::var("MRF_FUNCTION_NAME") {
            self.function_name = v;
        }
        if let Ok(v) = std::env::var("MRF_CACHE") {
            match v.as_str() {
                "none" => self.cache = CacheKind::None,
                "memory" => self.cache = CacheKind::Memory,
                other => warn!("ignoring unknown MRF_CACHE={:?}", other),
            }
        }
        if let Some(v) = parsed("MRF_FAIL_FAST") {
            self.fail_fast = v;
        }
        if let Some(v) = parsed("MRF_VERBOSE") {
            self.verbose = v;
        }
    }

    /// Enforce cross-field invariants. A split may never outgrow a map bin,
    /// otherwise the packer could not place it.
    pub fn normalize(&mut self) {
        if self.split_size == 0 || self.map_bin_size == 0 || self.reduce_bin_size == 0 {
            warn!("zero-byte sizes are not usable, raising to 1");
            self.split_size = self.split_size.max(1);
            self.map_bin_size = self.map_bin_size.max(1);
            self.reduce_bin_size = self.reduce_bin_size.max(1);
        }
        if self.split_size > self.map_bin_size {
            warn!(
                "configured split size {} is larger than map bin size {}, narrowing",
                self.split_size, self.map_bin_size
            );
            self.split_size = self.map_bin_size;
        }
        if self.max_concurrency == 0 {
            self.max_concurrency = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_narrows_split_size() {
        let mut config = Config {
            split_size: 2048,
            map_bin_size: 1024,
            ..Config::default()
        };
        config.normalize();
        assert_eq!(config.split_size, 1024);
        assert_eq!(config.map_bin_size, 1024);

        let mut config = Config {
            split_size: 512,
            map_bin_size: 1024,
            max_concurrency: 0,
            ..Config::default()
        };
        config.normalize();
        assert_eq!(config.split_size, 512);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn backend_parses_known_names() {
        assert_eq!("lambda".parse::<Backend>().unwrap(), Backend::Lambda);
        assert_eq!("whisk".parse::<Backend>().unwrap(), Backend::Whisk);
        assert!("fargate".parse::<Backend>().is_err());
    }

    #[test]
    fn settings_file_overlays_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mrf.yml");
        std::fs::write(
            &path,
            "splitSize: 4096\nworkingLocation: /tmp/mrf-out\nbackend: whisk\n",
        )
        .unwrap();

        let config = Config::from_settings_file(&path);
        assert_eq!(config.split_size, 4096);
        assert_eq!(config.working_location, "/tmp/mrf-out");
        assert_eq!(config.backend, Backend::Whisk);
        // untouched keys keep their defaults
        assert_eq!(config.max_concurrency, 100);
    }
}
