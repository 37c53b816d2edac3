use std::ffi::OsString;
use std::path::{Path, PathBuf};

use log::{info, warn};
use lockstep_core::VmConfig;
use lockstep_core::audio::{BLOCK_COUNT, DEFAULT_BLOCK_COUNT};
use serde::Deserialize;
use thiserror::Error;

const FILE_NAME: &str = "lockstep.toml";
const ENV_OVERRIDE: &str = "LOCKSTEP_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("machine.sound_blocks must be between 1 and {BLOCK_COUNT}, got {0}")]
    SoundBlocks(usize),
}

/// Where the runner config comes from.
///
/// A file named on the command line or through `LOCKSTEP_CONFIG` is required
/// to load. A file found by looking around is best effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Required(PathBuf),
    Discovered(PathBuf),
    Defaults,
}

/// Pick the config file: `--config`, then `LOCKSTEP_CONFIG`, then
/// `lockstep.toml` in `cwd`, then the per-user config directory.
pub fn locate(
    explicit: Option<&Path>,
    env: impl Fn(&str) -> Option<OsString>,
    cwd: &Path,
) -> ConfigSource {
    if let Some(path) = explicit {
        return ConfigSource::Required(path.to_path_buf());
    }
    if let Some(path) = env(ENV_OVERRIDE).filter(|p| !p.is_empty()) {
        return ConfigSource::Required(PathBuf::from(path));
    }

    let local = cwd.join(FILE_NAME);
    if local.is_file() {
        return ConfigSource::Discovered(local);
    }
    match user_config_dir(&env) {
        Some(dir) if dir.join(FILE_NAME).is_file() => {
            ConfigSource::Discovered(dir.join(FILE_NAME))
        }
        _ => ConfigSource::Defaults,
    }
}

fn user_config_dir(env: &impl Fn(&str) -> Option<OsString>) -> Option<PathBuf> {
    let base = if cfg!(target_os = "windows") {
        env("APPDATA").map(PathBuf::from)
    } else {
        env("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| env("HOME").map(|home| Path::new(&home).join(".config")))
    };
    base.map(|dir| dir.join("lockstep"))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineSection {
    pub state_directory: Option<PathBuf>,
    pub sound_blocks: usize,
}

impl Default for MachineSection {
    fn default() -> Self {
        Self {
            state_directory: None,
            sound_blocks: DEFAULT_BLOCK_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSection {
    pub audio: bool,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self { audio: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    pub machine: MachineSection,
    pub output: OutputSection,
}

impl RunnerConfig {
    /// Machine settings, rejecting a sound block count the mixer would clamp.
    pub fn vm_config(&self) -> Result<VmConfig, ConfigError> {
        let blocks = self.machine.sound_blocks;
        if !(1..=BLOCK_COUNT).contains(&blocks) {
            return Err(ConfigError::SoundBlocks(blocks));
        }
        let defaults = VmConfig::default();
        Ok(VmConfig {
            state_directory: self
                .machine
                .state_directory
                .clone()
                .unwrap_or(defaults.state_directory),
            spu_block_count: blocks,
        })
    }
}

fn read(path: &Path) -> Result<RunnerConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load(source: &ConfigSource) -> Result<RunnerConfig, ConfigError> {
    match source {
        ConfigSource::Required(path) => {
            let cfg = read(path)?;
            info!("Using config {}", path.display());
            Ok(cfg)
        }
        ConfigSource::Discovered(path) => match read(path) {
            Ok(cfg) => {
                info!("Using config {}", path.display());
                Ok(cfg)
            }
            Err(e) => {
                warn!("Ignoring config: {e}");
                Ok(RunnerConfig::default())
            }
        },
        ConfigSource::Defaults => Ok(RunnerConfig::default()),
    }
}
