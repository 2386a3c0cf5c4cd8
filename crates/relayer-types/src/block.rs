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

use ethers::types::H256;
use serde::{Deserialize, Serialize};

/// The identity of a ledger block as seen by the relayer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct BlockInfo {
    /// Block height.
    pub number: u64,
    /// Block hash.
    pub hash: H256,
    /// Block timestamp, in seconds since the unix epoch.
    pub timestamp: u64,
}

impl BlockInfo {
    /// Creates a new block reference.
    pub fn new(number: u64, hash: H256, timestamp: u64) -> Self {
        Self {
            number,
            hash,
            timestamp,
        }
    }
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({:?})", self.number, self.hash)
    }
}
