//! Server configuration loading
//!
//! Priority:
//! 1. `--config` flag
//! 2. `AWARDLENS_CONFIG` environment variable (path to TOML file)
//! 3. `./application.toml`
//! 4. Default configuration
//!
//! `AWARDLENS_*` environment overrides apply on top of every source.

use awardlens::Config;
use std::path::{Path, PathBuf};

/// Where the configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Explicit file
    File(PathBuf),
    /// Built-in defaults plus environment overrides
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Defaults => f.write_str("defaults"),
        }
    }
}

/// Load configuration following the priority order above
///
/// An explicitly named file that fails to parse is an error; a broken
/// `application.toml` falls back to defaults with a message on stderr,
/// since logging is not initialized yet.
pub fn load_config(explicit: Option<&Path>) -> Result<(Config, ConfigSource), String> {
    let named = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("AWARDLENS_CONFIG").map(PathBuf::from));

    if let Some(path) = named {
        let config = Config::from_file_with_env(&path.to_string_lossy())
            .map_err(|e| format!("failed to load {}: {}", path.display(), e))?;
        return Ok((config, ConfigSource::File(path)));
    }

    let app_toml = Path::new("application.toml");
    if app_toml.exists() {
        match Config::from_file_with_env("application.toml") {
            Ok(config) => return Ok((config, ConfigSource::File(app_toml.to_path_buf()))),
            Err(e) => {
                eprintln!("[config] Failed to parse application.toml: {}. Using defaults.", e);
            },
        }
    }

    Ok((Config::from_env(), ConfigSource::Defaults))
}
