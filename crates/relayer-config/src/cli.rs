// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::RelayerConfig;
use anyhow::Context;
use directories_next::ProjectDirs;
use std::path::{Path, PathBuf};
use structopt::StructOpt;

/// Package identifier, where the default configuration & database are defined.
/// If the user does not start the relayer with the `--config-dir`
/// it will default to read from the default location depending on the OS.
pub const PACKAGE_ID: [&str; 3] = ["network", "mtx", "mtx-relayer"];

/// Log targets enabled at the requested verbosity.
const LOG_TARGETS: [&str; 5] = [
    "mtx_relayer",
    "mtx_relayer_tx_manager",
    "mtx_relayer_registration",
    "mtx_relayer_context",
    mtx_relayer_utils::probe::TARGET,
];

/// The Meta-Transaction Relayer Command-line tool
///
/// Start the relayer from a config directory:
///
/// $ mtx-relayer -vvv -c <CONFIG_DIR_PATH>
#[derive(StructOpt, Debug, Default)]
#[structopt(name = "Meta-Transaction Relayer")]
pub struct Opts {
    /// A level of verbosity, and can be used multiple times
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: i32,
    /// Directory that contains configration files.
    #[structopt(
        short = "c",
        long = "config-dir",
        value_name = "PATH",
        parse(from_os_str)
    )]
    pub config_dir: Option<PathBuf>,
    /// Create the Database Store in a temporary directory.
    /// and will be deleted when the process exits.
    #[structopt(long)]
    pub tmp: bool,
}

/// Loads the configuration from the given directory, or from the
/// OS specific default config directory.
pub fn load_config<P>(
    config_dir: Option<P>,
) -> Result<RelayerConfig, anyhow::Error>
where
    P: AsRef<Path>,
{
    tracing::debug!("Getting default dirs for mtx relayer");
    let dirs = ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
        .context("failed to get config")?;
    let path = match config_dir {
        Some(p) => p.as_ref().to_path_buf(),
        None => dirs.config_dir().to_path_buf(),
    };
    // return an error if the path is not a directory.
    if !path.is_dir() {
        return Err(anyhow::anyhow!("{} is not a directory", path.display()));
    }
    tracing::trace!("Loading Config from {} ..", path.display());
    let v = crate::utils::load(path)?;
    tracing::trace!("Config loaded..");
    Ok(v)
}

/// Sets up the logger for the relayer, based on the verbosity level passed in.
///
/// `0` only shows errors, every extra `-v` lowers the level down to `TRACE`.
pub fn setup_logger(verbosity: i32) -> anyhow::Result<()> {
    use tracing::Level;
    let log_level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env();
    for target in LOG_TARGETS {
        let directive = format!("{target}={log_level}")
            .parse()
            .context("invalid log directive")?;
        env_filter = env_filter.add_directive(directive);
    }
    let logger = tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(log_level)
        .with_env_filter(env_filter);
    // if we are not compiling for integration tests, we should use pretty logs
    #[cfg(not(feature = "integration-tests"))]
    let logger = logger.pretty();
    // otherwise, we should use json, which is easy to parse.
    #[cfg(feature = "integration-tests")]
    let logger = logger.json().flatten_event(true).with_current_span(false);

    logger.try_init().map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

/// The directory where the database and the keystore live.
///
/// It is the sibling `store` directory of the config directory, or the
/// OS specific local data directory.
pub fn data_dir(opts: &Opts) -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
        .context("failed to get config")?;
    let path = match opts.config_dir.as_ref() {
        Some(p) => match p.parent() {
            Some(parent) => parent.join("store"),
            None => p.join("store"),
        },
        None => dirs.data_local_dir().join("store"),
    };
    Ok(path)
}

/// Creates a database store for the relayer based on the options passed in.
pub fn create_store(
    opts: &Opts,
) -> anyhow::Result<mtx_relayer_store::SledStore> {
    // check if we shall use the temp dir.
    if opts.tmp {
        tracing::debug!("Using temp dir for store");
        let store = mtx_relayer_store::SledStore::temporary()?;
        return Ok(store);
    }
    let db_path = data_dir(opts)?;
    tracing::debug!("Opening store at {}", db_path.display());
    let store = mtx_relayer_store::SledStore::open(db_path)?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_lives_next_to_the_config_dir() {
        let opts = Opts {
            config_dir: Some(PathBuf::from("/etc/mtx/config")),
            ..Default::default()
        };
        assert_eq!(data_dir(&opts).unwrap(), PathBuf::from("/etc/mtx/store"));
    }

    #[test]
    fn parses_cli_flags() {
        let opts = Opts::from_iter(["mtx-relayer", "-vvv", "-c", "/tmp/cfg", "--tmp"]);
        assert_eq!(opts.verbose, 3);
        assert!(opts.tmp);
        assert_eq!(opts.config_dir, Some(PathBuf::from("/tmp/cfg")));
    }
}
