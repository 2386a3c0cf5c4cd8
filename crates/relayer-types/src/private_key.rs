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

use std::str::FromStr;

use ethers::types::H256;
use serde::Deserialize;

/// PrivateKey represents a secp256k1 private key used by the key manager.
///
/// The value is never printed; `Debug` only shows the type name.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(H256);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PrivateKey").finish()
    }
}

impl From<H256> for PrivateKey {
    fn from(secret: H256) -> Self {
        PrivateKey(secret)
    }
}

impl std::ops::Deref for PrivateKey {
    type Target = H256;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn parse_hex_secret<E: serde::de::Error>(value: &str) -> Result<H256, E> {
    H256::from_str(value).map_err(|e| {
        serde::de::Error::custom(format!(
            "{e}\n expected a 66 chars string (including the 0x prefix) but found {} char",
            value.len()
        ))
    })
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PrivateKeyVistor;
        impl<'de> serde::de::Visitor<'de> for PrivateKeyVistor {
            type Value = H256;

            fn expecting(
                &self,
                formatter: &mut std::fmt::Formatter,
            ) -> std::fmt::Result {
                formatter.write_str(
                    "hex string or an env var containing a hex string in it",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value.starts_with("0x") {
                    parse_hex_secret(value)
                } else if let Some(var) = value.strip_prefix('$') {
                    tracing::trace!("Reading {} from env", var);
                    let val = std::env::var(var).map_err(|e| {
                        serde::de::Error::custom(format!(
                            "error while loading this env {var}: {e}",
                        ))
                    })?;
                    parse_hex_secret(val.trim())
                } else {
                    Err(serde::de::Error::custom(
                        "private key must be a 0x-prefixed hex string or a $ENV_VAR reference",
                    ))
                }
            }
        }

        let secret = deserializer.deserialize_str(PrivateKeyVistor)?;
        Ok(Self(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str =
        "0x8da4ef21b864d2cc526dbdb2a120bd2874c36c9d0a1fb7f8c63d7f7a8b41de8f";

    #[test]
    fn parses_hex_and_env_keys() {
        let direct: PrivateKey =
            serde_json::from_str(&format!("\"{KEY}\"")).unwrap();
        std::env::set_var("MTX_TEST_PRIVATE_KEY", KEY);
        let from_env: PrivateKey =
            serde_json::from_str("\"$MTX_TEST_PRIVATE_KEY\"").unwrap();
        assert_eq!(direct, from_env);
        assert_eq!(format!("{direct:?}"), "PrivateKey");
    }

    #[test]
    fn rejects_bare_strings() {
        let res: Result<PrivateKey, _> = serde_json::from_str("\"not-a-key\"");
        assert!(res.is_err());
    }
}
