/*
 * This file is part of Sensorreg.
 *
 * Copyright (C) 2025 Sensorreg contributors
 *
 * Sensorreg is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Sensorreg is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Sensorreg. If not, see <https://www.gnu.org/licenses/>.
 */

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{Resolution, DEFAULT_W1_ROOT};
use crate::registry::{CollisionPolicy, HEADER_LEN, MAX_NAME_LEN_LIMIT};

pub const MAX_STORE_CAPACITY: usize = 65536;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BusConfig {
    W1 {
        #[serde(default = "default_w1_root")]
        root: PathBuf,
    },
    Simulated {
        path: PathBuf,
    },
}

fn default_w1_root() -> PathBuf { PathBuf::from(DEFAULT_W1_ROOT) }
fn default_store_path() -> PathBuf { PathBuf::from("/var/lib/sensorreg/eeprom.bin") }
fn default_store_capacity() -> usize { 512 }
fn default_max_name_len() -> usize { 32 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_resolution_bits() -> u8 { 9 }
fn default_prompt_timeout_secs() -> u64 { 60 }
fn default_name_prefix() -> String { "sensor-".to_string() }
fn default_bus() -> BusConfig { BusConfig::W1 { root: default_w1_root() } }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_store_capacity")]
    pub store_capacity: usize,
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_resolution_bits")]
    pub resolution_bits: u8,
    /// Upper bound on the blocking name prompt during discovery.
    #[serde(default = "default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,
    #[serde(default = "default_name_prefix")]
    pub default_name_prefix: String,
    #[serde(default = "default_bus")]
    pub bus: BusConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            store_capacity: default_store_capacity(),
            max_name_len: default_max_name_len(),
            collision_policy: CollisionPolicy::default(),
            poll_interval_ms: default_poll_interval_ms(),
            resolution_bits: default_resolution_bits(),
            prompt_timeout_secs: default_prompt_timeout_secs(),
            default_name_prefix: default_name_prefix(),
            bus: default_bus(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    /// Configured resolution; validation guarantees a supported value.
    pub fn resolution(&self) -> Resolution {
        Resolution::from_bits(self.resolution_bits).unwrap_or(Resolution::Bits9)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        return Path::new(&xdg).join("sensorreg").join("config.json");
    }
    if let Ok(home) = env::var("HOME") {
        return Path::new(&home)
            .join(".config")
            .join("sensorreg")
            .join("config.json");
    }
    PathBuf::from("/etc/sensorreg/config.json")
}

fn is_safe_prefix(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ' | ':'))
}

pub fn validate_config(cfg: &Config) -> Result<(), String> {
    if cfg.max_name_len == 0 || cfg.max_name_len > MAX_NAME_LEN_LIMIT {
        return Err(format!("max_name_len must be 1..={}", MAX_NAME_LEN_LIMIT));
    }
    let slot_size = cfg.max_name_len + cfg.collision_policy.slot_overhead();
    if cfg.store_capacity < HEADER_LEN + slot_size {
        return Err(format!(
            "store_capacity {} cannot hold the header and one {}-byte slot",
            cfg.store_capacity, slot_size
        ));
    }
    if cfg.store_capacity > MAX_STORE_CAPACITY {
        return Err(format!("store_capacity above {} bytes", MAX_STORE_CAPACITY));
    }
    if cfg.poll_interval_ms == 0 {
        return Err("poll_interval_ms must be positive".to_string());
    }
    if Resolution::from_bits(cfg.resolution_bits).is_none() {
        return Err(format!("resolution_bits must be 9..=12, got {}", cfg.resolution_bits));
    }
    if cfg.default_name_prefix.len() > cfg.max_name_len {
        return Err("default_name_prefix longer than max_name_len".to_string());
    }
    if !is_safe_prefix(&cfg.default_name_prefix) {
        return Err("invalid characters in default_name_prefix".to_string());
    }
    Ok(())
}

/// Load and validate the config at `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let cfg = match fs::read_to_string(path) {
        Ok(data) => serde_json::from_str::<Config>(&data)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Config::default(),
        Err(source) => return Err(ConfigError::Io { path: path.to_path_buf(), source }),
    };
    validate_config(&cfg).map_err(ConfigError::Invalid)?;
    Ok(cfg)
}

pub fn write_config(path: &Path, cfg: &Config) -> io::Result<()> {
    validate_config(cfg).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(cfg).map_err(io::Error::other)?;
    fs::write(path, json)
}
