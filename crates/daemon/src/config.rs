//! Loads the `[global]` section of the daemon's INI config file,
//! overriding the allocator's default preference constants. Defaults come
//! from [`crate::constants`] and are only overridden if the section/key
//! is actually present.

use std::path::Path;
use std::str::FromStr;

use bytesize::ByteSize;
use configparser::ini::Ini;

use crate::allocator::Allocator;
use crate::constants;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid size for [global] {key}: {value:?}")]
    InvalidSize { key: &'static str, value: String },
    #[error("invalid float for [global] {key}: {value:?}")]
    InvalidFloat { key: &'static str, value: String },
}

/// Config-derived allocator plus anything else an operator can tune.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub allocator: Allocator,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allocator: Allocator::default(),
        }
    }
}

impl Config {
    /// Load `path`, falling back to built-in defaults for any absent
    /// key or section. A missing file is not an error: a default path is
    /// always probed, and an explicit `--config` path is not required to
    /// exist unless the operator actually wants overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let mut ini = Ini::new();
        ini.load(path).map_err(|message| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        })?;

        let mut allocator = Allocator::default();

        if let Some(value) = ini.get("global", "vm-min-mem") {
            allocator.min_prefmem = parse_size("vm-min-mem", &value)?;
        }
        if let Some(value) = ini.get("global", "dom0-mem-boost") {
            allocator.dom0_mem_boost = parse_size("dom0-mem-boost", &value)?;
        }
        if let Some(value) = ini.get("global", "cache-margin-factor") {
            allocator.cache_factor =
                f64::from_str(value.trim()).map_err(|_| ConfigError::InvalidFloat {
                    key: "cache-margin-factor",
                    value,
                })?;
        }

        Ok(Self { allocator })
    }
}

/// Accepts human-readable sizes ("200MB", "1.5GiB") as well as bare byte
/// counts.
fn parse_size(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let trimmed = raw.trim();
    if let Ok(bytes) = trimmed.parse::<u64>() {
        return Ok(bytes);
    }
    ByteSize::from_str(trimmed)
        .map(|b| b.as_u64())
        .map_err(|_| ConfigError::InvalidSize {
            key,
            value: raw.to_string(),
        })
}

pub fn default_sock_path() -> &'static str {
    constants::DEFAULT_SOCK_PATH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_default() {
        let cfg = Config::load(Path::new("/nonexistent/qmemman.conf")).unwrap();
        assert_eq!(cfg.allocator.min_prefmem, constants::MIN_PREFMEM);
    }

    #[test]
    fn overrides_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmemman.conf");
        std::fs::write(
            &path,
            "[global]\nvm-min-mem = 400MB\ndom0-mem-boost = 512MB\ncache-margin-factor = 1.5\n",
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.allocator.min_prefmem, 400_000_000);
        assert_eq!(cfg.allocator.dom0_mem_boost, 512_000_000);
        assert_eq!(cfg.allocator.cache_factor, 1.5);
    }
}
