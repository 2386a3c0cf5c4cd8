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

//! `serde` helpers for token amounts in config files.
//!
//! Amounts are accepted as plain integers (`100000000000000000`), decimal
//! strings (`"100000000000000000"`), hex strings (`"0x16345785d8a0000"`) or a
//! decimal number with a unit suffix (`"0.1 ether"`, `"20 gwei"`).

use ethers::types::U256;
use ethers::utils::parse_units;
use serde::{Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(u64),
    Text(String),
}

/// Parses a human written amount into wei.
pub fn parse_amount(value: &str) -> Result<U256, String> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x") {
        return U256::from_str_radix(hex, 16).map_err(|e| e.to_string());
    }
    let mut parts = value.split_whitespace();
    let number = parts.next().ok_or_else(|| "empty amount".to_string())?;
    match parts.next() {
        None => U256::from_dec_str(number).map_err(|e| e.to_string()),
        Some(unit) => parse_units(number, unit)
            .map(Into::into)
            .map_err(|e| e.to_string()),
    }
}

/// Deserializes a required amount.
pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    match RawAmount::deserialize(deserializer)? {
        RawAmount::Number(n) => Ok(U256::from(n)),
        RawAmount::Text(s) => {
            parse_amount(&s).map_err(serde::de::Error::custom)
        }
    }
}

/// Serializes an amount as a decimal string.
pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

/// Same as the parent module, for optional amounts.
pub mod option {
    use super::*;

    /// Deserializes an optional amount.
    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<Option<U256>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<RawAmount>::deserialize(deserializer)? {
            None => Ok(None),
            Some(RawAmount::Number(n)) => Ok(Some(U256::from(n))),
            Some(RawAmount::Text(s)) => parse_amount(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }

    /// Serializes an optional amount.
    pub fn serialize<S>(
        value: &Option<U256>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => super::serialize(v, serializer),
            None => serializer.serialize_none(),
        }
    }
}
