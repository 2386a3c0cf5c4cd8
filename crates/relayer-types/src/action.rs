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

/// The semantic purpose of a transaction sent by the relayer.
///
/// Every stored transaction carries one of these, so that the relayer can
/// answer questions like "is a registration already pending?" without
/// decoding calldata.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ServerAction {
    /// `StakeManager.setRelayManagerOwner(owner)`.
    SetOwner,
    /// `RelayHub.addRelayWorkers(workers)`.
    AddWorker,
    /// `RelayHub.registerRelayServer(url)`.
    RegisterServer,
    /// `RelayHub.withdraw(amount, dest)` from the manager's hub deposit.
    DepositWithdrawal,
    /// A plain native-currency transfer.
    ValueTransfer,
    /// `RelayHub.relayCall(...)` on behalf of a single end-user request.
    RelayCall,
    /// A relay call routed through the batch gateway.
    BatchRelayCall,
}

impl std::fmt::Display for ServerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SetOwner => "set-owner",
            Self::AddWorker => "add-worker",
            Self::RegisterServer => "register-server",
            Self::DepositWithdrawal => "deposit-withdrawal",
            Self::ValueTransfer => "value-transfer",
            Self::RelayCall => "relay-call",
            Self::BatchRelayCall => "batch-relay-call",
        };
        f.write_str(s)
    }
}

/// How relay calls are submitted to the ledger.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SubmissionMode {
    /// Each relay request becomes its own `relayCall` transaction to the hub.
    #[default]
    Individual,
    /// Relay requests are forwarded to a batch gateway contract.
    Batched,
}

impl SubmissionMode {
    /// The action tag used for relay calls in this mode.
    pub fn relay_call_action(&self) -> ServerAction {
        match self {
            Self::Individual => ServerAction::RelayCall,
            Self::Batched => ServerAction::BatchRelayCall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_use_kebab_case_on_the_wire() {
        let json = serde_json::to_string(&ServerAction::RegisterServer).unwrap();
        assert_eq!(json, "\"register-server\"");
        let mode: SubmissionMode =
            serde_json::from_str("\"batched\"").unwrap();
        assert_eq!(mode, SubmissionMode::Batched);
        assert_eq!(mode.relay_call_action(), ServerAction::BatchRelayCall);
        assert_eq!(
            SubmissionMode::default().relay_call_action(),
            ServerAction::RelayCall
        );
    }
}
