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

use std::time::Duration;

use ethers::providers::{HttpClientError, JsonRpcError, RetryPolicy};

/// Retry policy of the ledger HTTP transport.
///
/// Rate limits and the transient "header not found" of load balanced nodes
/// are retried. Everything else, and in particular broadcast rejections
/// such as "nonce too low", is surfaced to the caller at once.
#[derive(Debug)]
pub struct LedgerHttpRetryPolicy {
    err_regex: regex::Regex,
}

impl LedgerHttpRetryPolicy {
    /// Creates the policy.
    pub fn new() -> Self {
        Self {
            err_regex: regex::Regex::new(
                r"(?mixU)\b(?:rate|limit|429|Too \s Many \s Requests)\b",
            )
            .expect("valid regex"),
        }
    }

    /// Creates a boxed policy, as expected by `RetryClient`.
    pub fn boxed() -> Box<Self> {
        Box::new(Self::new())
    }

    fn should_retry_text(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        let should_retry = self.err_regex.is_match(&text)
            || text == "expected value at line 1 column 1";
        tracing::event!(
            target: mtx_relayer_utils::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %mtx_relayer_utils::probe::Kind::Retry,
            should_retry = should_retry,
            error = %text,
        );
        should_retry
    }
}

impl Default for LedgerHttpRetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn should_retry_json_rpc_error(err: &JsonRpcError) -> bool {
    let JsonRpcError { code, message, .. } = err;
    match code {
        // plain http rate limit, or the infura `exceeded project rate limit`.
        429 | -32005 => true,
        -32016 => message.contains("rate limit"),
        _ => matches!(
            message.as_str(),
            "header not found"
                | "daily request count exceeded, request rate limited"
        ),
    }
}

impl RetryPolicy<HttpClientError> for LedgerHttpRetryPolicy {
    fn should_retry(&self, error: &HttpClientError) -> bool {
        tracing::trace!("should_retry: {:?}", error);
        #[allow(unreachable_patterns)]
        match error {
            HttpClientError::ReqwestError(err) => {
                err.status() == Some(http::StatusCode::TOO_MANY_REQUESTS)
            }
            HttpClientError::JsonRpcError(err) => {
                should_retry_json_rpc_error(err)
            }
            // some providers answer with an invalid JSON RPC body
            // that only carries the error text.
            HttpClientError::SerdeJson { text, .. } => {
                self.should_retry_text(text)
            }
            _ => false,
        }
    }

    fn backoff_hint(&self, error: &HttpClientError) -> Option<Duration> {
        const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
        // infura returns the requested backoff when rate limited.
        let requested = match error {
            HttpClientError::JsonRpcError(err) => err
                .data
                .as_ref()
                .and_then(|data| data.get("rate"))
                .and_then(|rate| rate.get("backoff_seconds"))
                .and_then(|secs| {
                    secs.as_u64().or_else(|| secs.as_f64().map(|s| s as u64 + 1))
                }),
            _ => None,
        };
        Some(requested.map(Duration::from_secs).unwrap_or(DEFAULT_BACKOFF))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc_error(code: i64, message: &str) -> JsonRpcError {
        JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        }
    }

    #[test]
    fn rate_limits_are_retried_but_rejections_are_not() {
        assert!(should_retry_json_rpc_error(&rpc_error(429, "slow down")));
        assert!(should_retry_json_rpc_error(&rpc_error(-32000, "header not found")));
        assert!(!should_retry_json_rpc_error(&rpc_error(-32000, "nonce too low")));
        assert!(!should_retry_json_rpc_error(&rpc_error(
            -32000,
            "replacement transaction underpriced"
        )));
    }
}
