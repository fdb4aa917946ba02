/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::env;
use std::path::PathBuf;

pub const ENV_WITH_NON_MPI: &str = "RECORDER_WITH_NON_MPI";
pub const ENV_COMPRESSION_MODE: &str = "RECORDER_COMPRESSION_MODE";
pub const ENV_TRACES_DIR: &str = "RECORDER_TRACES_DIR";
pub const ENV_SIGNAL_HANDLERS: &str = "RECORDER_INSTALL_SIGNAL_HANDLERS";

pub const DEFAULT_TRACES_DIR: &str = "recorder-logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    Text,
    Binary,
    Windowed,
}

impl CompressionMode {
    pub fn from_i32(value: i32) -> Option<CompressionMode> {
        match value {
            0 => Some(CompressionMode::Text),
            1 => Some(CompressionMode::Binary),
            2 => Some(CompressionMode::Windowed),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            CompressionMode::Text => 0,
            CompressionMode::Binary => 1,
            CompressionMode::Windowed => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub compression_mode: CompressionMode,
    /// Trace output directory
    pub traces_dir: PathBuf,
    /// Drive init/finalize from process startup/exit hooks
    pub with_non_mpi: bool,
    /// Install SIGSEGV/SIGINT/SIGTERM handlers that finalize the trace
    pub signal_handlers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            compression_mode: CompressionMode::Windowed,
            traces_dir: PathBuf::from(DEFAULT_TRACES_DIR),
            with_non_mpi: false,
            signal_handlers: false,
        }
    }
}

impl Config {
    /// Read configuration from the environment. Unparsable values fall
    /// back to the defaults.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(mode) = env::var(ENV_COMPRESSION_MODE) {
            match mode.trim().parse::<i32>().ok().and_then(CompressionMode::from_i32) {
                Some(mode) => config.compression_mode = mode,
                None => log::warn!("ignoring invalid {}='{}'", ENV_COMPRESSION_MODE, mode),
            }
        }
        if let Ok(dir) = env::var(ENV_TRACES_DIR) {
            if !dir.is_empty() {
                config.traces_dir = PathBuf::from(dir);
            }
        }
        config.with_non_mpi = env_flag(ENV_WITH_NON_MPI);
        config.signal_handlers = env_flag(ENV_SIGNAL_HANDLERS);
        config
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).map(|v| v.trim() == "1").unwrap_or(false)
}
