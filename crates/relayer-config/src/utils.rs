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

use config::{Config, File};
use std::path::{Path, PathBuf};

use crate::RelayerConfig;

/// Prefix of the environment variables merged into the configuration, so
/// `MTX_URL` overrides `url`. Nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "MTX";

/// A helper function that will search for all config files in the given directory and return them as a vec
/// of the paths.
///
/// Supported file extensions are:
/// - `.toml`.
/// - `.json`.
pub fn search_config_files<P: AsRef<Path>>(
    base_dir: P,
) -> mtx_relayer_utils::Result<Vec<PathBuf>> {
    // A pattern that covers all toml or json files in the config directory and subdirectories.
    let toml_pattern = format!("{}/**/*.toml", base_dir.as_ref().display());
    let json_pattern = format!("{}/**/*.json", base_dir.as_ref().display());
    tracing::trace!(
        "Loading config files from {} and {}",
        toml_pattern,
        json_pattern
    );
    let toml_files = glob::glob(&toml_pattern)?;
    let json_files = glob::glob(&json_pattern)?;
    toml_files
        .chain(json_files)
        .map(|v| v.map_err(mtx_relayer_utils::Error::from))
        .collect()
}

/// Try to parse the [`RelayerConfig`] from the given config file(s).
pub fn parse_from_files(
    files: &[PathBuf],
) -> mtx_relayer_utils::Result<RelayerConfig> {
    let mut builder = Config::builder();
    for config_file in files {
        tracing::trace!("Loading config file: {}", config_file.display());
        let ext = config_file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let format = match ext {
            "toml" => config::FileFormat::Toml,
            "json" => config::FileFormat::Json,
            _ => {
                tracing::warn!("Unknown file extension: {}", ext);
                continue;
            }
        };
        builder = builder
            .add_source(File::from(config_file.as_path()).format(format));
    }

    // also merge in the environment (with a prefix of MTX).
    let builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__"),
    );
    let cfg = builder.build()?;
    let config: Result<
        RelayerConfig,
        serde_path_to_error::Error<config::ConfigError>,
    > = serde_path_to_error::deserialize(cfg);
    match config {
        Ok(c) => postloading_process(c),
        Err(e) => {
            tracing::error!("{}", e);
            Err(e.into())
        }
    }
}

/// Load the configuration files and
///
/// Returns `Ok(RelayerConfig)` on success, or an error on failure.
///
/// it is the same as using the [`search_config_files`] and [`parse_from_files`] functions combined.
pub fn load<P: AsRef<Path>>(
    path: P,
) -> mtx_relayer_utils::Result<RelayerConfig> {
    parse_from_files(&search_config_files(path)?)
}

/// The postloading_process exists to validate configuration and standardize
/// the format of the configuration
pub fn postloading_process(
    mut config: RelayerConfig,
) -> mtx_relayer_utils::Result<RelayerConfig> {
    tracing::trace!("Checking configration sanity ...");
    // the url is compared byte for byte with the registered one.
    config.url = config.url.trim().trim_end_matches('/').to_string();
    if config.pending_transaction_timeout_blocks == 0 {
        tracing::warn!(
            "!!WARNING!!: pending-transaction-timeout-blocks is 0, every unmined transaction will be boosted on each block"
        );
    }
    if config.confirmations_needed == 0 {
        tracing::warn!(
            "!!WARNING!!: confirmations-needed is 0, transactions are forgotten as soon as they are mined"
        );
    }
    config.verify()?;

    tracing::trace!(
        "postloaded config: {}",
        serde_json::to_string_pretty(&config)?
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_and_merges_toml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.toml"),
            r#"
url = "https://relay.example.org/"
relay-hub-address = "0x1111111111111111111111111111111111111111"
owner-address = "0x2222222222222222222222222222222222222222"
pending-transaction-timeout-blocks = 10

[ledger]
http-endpoint = "http://localhost:8545"
"#,
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("extra")).unwrap();
        std::fs::write(
            dir.path().join("extra").join("balances.json"),
            r#"{ "worker-target-balance": "2 ether", "boost-cooldown-blocks": 4 }"#,
        )
        .unwrap();

        let config = load(dir.path()).unwrap();
        assert_eq!(config.url, "https://relay.example.org");
        assert_eq!(config.pending_transaction_timeout_blocks, 10);
        assert_eq!(config.boost_cooldown_blocks(), 4);
        assert_eq!(
            config.worker_target_balance,
            ethers::utils::WEI_IN_ETHER * 2
        );
    }

    #[test]
    fn invalid_files_report_the_failing_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.toml"),
            r#"
url = "https://relay.example.org"
relay-hub-address = "not-an-address"
owner-address = "0x2222222222222222222222222222222222222222"

[ledger]
http-endpoint = "http://localhost:8545"
"#,
        )
        .unwrap();
        let err = load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("relay-hub-address"));
    }
}
