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

use serde::{Deserialize, Serialize};

/// The ledger RPC endpoint, a wrapper around [`url::Url`] that can also be
/// read from an environment variable (`$VAR`). Only http(s) endpoints are
/// accepted since the relayer talks to the ledger over JSON-RPC/HTTP.
#[derive(Clone, Serialize)]
pub struct RpcUrl(url::Url);

impl RpcUrl {
    /// Returns the inner [`url::Url`].
    pub fn as_url(&self) -> &url::Url {
        &self.0
    }
}

impl std::fmt::Display for RpcUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // hide credentials and api keys that some providers put in the query.
        let scheme = self.0.scheme();
        write!(f, "{scheme}")?;
        if let Some(host) = self.0.host_str() {
            write!(f, "://{host}")?;
        }
        if let Some(port) = self.0.port_or_known_default() {
            write!(f, ":{port}")?;
        }
        write!(f, "{}", self.0.path())
    }
}

impl std::fmt::Debug for RpcUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")?;
        Ok(())
    }
}

impl From<RpcUrl> for url::Url {
    fn from(rpc_url: RpcUrl) -> Self {
        rpc_url.0
    }
}

impl From<url::Url> for RpcUrl {
    fn from(url: url::Url) -> Self {
        RpcUrl(url)
    }
}

impl std::ops::Deref for RpcUrl {
    type Target = url::Url;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for RpcUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct RpcUrlVistor;
        impl<'de> serde::de::Visitor<'de> for RpcUrlVistor {
            type Value = url::Url;

            fn expecting(
                &self,
                formatter: &mut std::fmt::Formatter,
            ) -> std::fmt::Result {
                formatter.write_str(
                    "rpc url string or an env var containing a rpc url string in it",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let raw = match value.strip_prefix('$') {
                    Some(var) => {
                        tracing::trace!("Reading {} from env", var);
                        std::env::var(var).map_err(|e| {
                            serde::de::Error::custom(format!(
                                "error while loading this env {var}: {e}",
                            ))
                        })?
                    }
                    None => value.to_owned(),
                };
                let url = url::Url::parse(raw.trim()).map_err(|e| {
                    serde::de::Error::custom(format!("{e:?}"))
                })?;
                match url.scheme() {
                    "http" | "https" => Ok(url),
                    other => Err(serde::de::Error::custom(format!(
                        "unsupported ledger endpoint scheme `{other}`, expected http or https"
                    ))),
                }
            }
        }

        let rpc_url = deserializer.deserialize_str(RpcUrlVistor)?;
        Ok(Self(rpc_url))
    }
}
