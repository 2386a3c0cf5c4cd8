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

//! Value types shared between the relayer config and the runtime crates.

/// Semantic tags attached to every transaction the relayer sends.
pub mod action;
/// Token amounts in config files.
pub mod amount;
/// Ledger block references.
pub mod block;
/// Private keys loaded from the config or the environment.
pub mod private_key;
/// Ledger RPC endpoints.
pub mod rpc_url;

pub use action::{ServerAction, SubmissionMode};
pub use block::BlockInfo;
pub use private_key::PrivateKey;
pub use rpc_url::RpcUrl;
