use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use std::collections::BTreeMap;

use super::crypto::{hash_value, verify_signature, Address, CryptoError, KeyPair};
use super::utxo::UtxoKey;
use crate::vm::{ContractCode, Value as VmValue};

/// Output address marking value locked into a contract; never materialized as a UTXO
pub const CONTRACT_ADDRESS: &str = "CONTRACT";

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Input index {index} out of bounds ({len} inputs)")]
    InvalidInputIndex { index: usize, len: usize },

    #[error("Transaction hash does not match its contents")]
    HashMismatch,

    #[error("Output {index} has invalid amount {amount}")]
    InvalidOutputAmount { index: usize, amount: f64 },

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Reference to a previous output, plus the proof of ownership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInput {
    pub tx_hash: String,
    pub output_index: u32,

    /// Compact hex signature over the transaction hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Hex public key the signature verifies against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl TransactionInput {
    pub fn new(tx_hash: impl Into<String>, output_index: u32) -> Self {
        TransactionInput {
            tx_hash: tx_hash.into(),
            output_index,
            signature: None,
            public_key: None,
        }
    }

    pub fn utxo_key(&self) -> UtxoKey {
        UtxoKey::new(self.tx_hash.clone(), self.output_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub address: Address,
    pub amount: f64,
}

impl TransactionOutput {
    pub fn new(address: Address, amount: f64) -> Self {
        TransactionOutput { address, amount }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDeploy {
    pub from: Address,
    pub code: ContractCode,
    pub gas_limit: u64,
    pub gas_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractCall {
    pub from: Address,
    pub contract_address: String,
    pub method: String,
    #[serde(default)]
    pub params: BTreeMap<String, VmValue>,
    pub gas_limit: u64,
    pub gas_price: f64,
}

/// What a transaction does beyond moving value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransactionKind {
    Transfer,
    Coinbase {
        #[serde(rename = "blockHeight")]
        block_height: u64,
    },
    ContractDeploy(ContractDeploy),
    ContractCall(ContractCall),
}

/// An immutable transaction
///
/// The content hash is computed once when the transaction is built. Inputs,
/// outputs and the payload cannot be changed afterwards; only input
/// signatures can be attached, and those are not part of the hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    inputs: Vec<TransactionInput>,
    outputs: Vec<TransactionOutput>,
    timestamp: i64,
    kind: TransactionKind,
    hash: String,
}

impl Transaction {
    /// Creates an unsigned value transfer
    pub fn new(inputs: Vec<TransactionInput>, outputs: Vec<TransactionOutput>) -> Self {
        Self::build(inputs, outputs, Utc::now().timestamp_millis(), TransactionKind::Transfer)
    }

    /// Creates the reward transaction of a block: no inputs, a single output
    pub fn coinbase(miner_address: Address, block_height: u64, reward: f64) -> Self {
        Self::coinbase_at(miner_address, block_height, reward, Utc::now().timestamp_millis())
    }

    pub(crate) fn coinbase_at(
        miner_address: Address,
        block_height: u64,
        reward: f64,
        timestamp: i64,
    ) -> Self {
        Self::build(
            Vec::new(),
            vec![TransactionOutput::new(miner_address, reward)],
            timestamp,
            TransactionKind::Coinbase { block_height },
        )
    }

    /// Creates a transaction deploying contract code
    pub fn contract_deploy(from: Address, code: ContractCode, gas_limit: u64, gas_price: f64) -> Self {
        let deploy = ContractDeploy {
            from,
            code,
            gas_limit,
            gas_price,
        };
        Self::build(
            Vec::new(),
            vec![TransactionOutput::new(Address::from(CONTRACT_ADDRESS), 0.0)],
            Utc::now().timestamp_millis(),
            TransactionKind::ContractDeploy(deploy),
        )
    }

    /// Creates a transaction calling a deployed contract
    pub fn contract_call(
        from: Address,
        contract_address: impl Into<String>,
        method: impl Into<String>,
        params: BTreeMap<String, VmValue>,
        gas_limit: u64,
        gas_price: f64,
    ) -> Self {
        let call = ContractCall {
            from,
            contract_address: contract_address.into(),
            method: method.into(),
            params,
            gas_limit,
            gas_price,
        };
        Self::build(
            Vec::new(),
            Vec::new(),
            Utc::now().timestamp_millis(),
            TransactionKind::ContractCall(call),
        )
    }

    fn build(
        inputs: Vec<TransactionInput>,
        outputs: Vec<TransactionOutput>,
        timestamp: i64,
        kind: TransactionKind,
    ) -> Self {
        let mut transaction = Transaction {
            inputs,
            outputs,
            timestamp,
            kind,
            hash: String::new(),
        };
        transaction.hash = transaction.calculate_hash();
        transaction
    }

    /// Recomputes the content hash
    ///
    /// Covers input references (never signatures), outputs, the timestamp and,
    /// for non-transfer transactions, the kind-specific payload.
    pub fn calculate_hash(&self) -> String {
        let inputs: Vec<Value> = self
            .inputs
            .iter()
            .map(|input| json!({ "txHash": input.tx_hash, "outputIndex": input.output_index }))
            .collect();

        let mut data = json!({
            "inputs": inputs,
            "outputs": self.outputs,
            "timestamp": self.timestamp,
        });
        if self.kind != TransactionKind::Transfer {
            data["kind"] = json!(self.kind);
        }

        hash_value(&data)
    }

    /// Signs one input with the given key pair
    ///
    /// The signature covers the transaction hash, and the public key is
    /// attached so validators can check ownership of the spent output.
    pub fn sign(&mut self, input_index: usize, keypair: &KeyPair) -> Result<(), TransactionError> {
        let len = self.inputs.len();
        if input_index >= len {
            return Err(TransactionError::InvalidInputIndex {
                index: input_index,
                len,
            });
        }

        let signature = keypair.sign_digest(&self.hash)?;
        let input = &mut self.inputs[input_index];
        input.signature = Some(signature);
        input.public_key = Some(keypair.public_key_hex());

        Ok(())
    }

    /// Signs every input with the same key pair
    pub fn sign_all(&mut self, keypair: &KeyPair) -> Result<(), TransactionError> {
        for index in 0..self.inputs.len() {
            self.sign(index, keypair)?;
        }
        Ok(())
    }

    /// Checks an input's signature against a public key
    ///
    /// Never fails: out-of-range indices, missing or malformed signatures all
    /// yield `false`.
    pub fn verify(&self, input_index: usize, public_key_hex: &str) -> bool {
        let Some(signature) = self
            .inputs
            .get(input_index)
            .and_then(|input| input.signature.as_deref())
        else {
            return false;
        };

        verify_signature(&self.calculate_hash(), signature, public_key_hex)
    }

    /// Whether the stored hash still matches the contents
    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn inputs(&self) -> &[TransactionInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TransactionOutput] {
        &self.outputs
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn kind(&self) -> &TransactionKind {
        &self.kind
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.kind, TransactionKind::Coinbase { .. })
    }

    pub fn is_contract_deploy(&self) -> bool {
        matches!(self.kind, TransactionKind::ContractDeploy(_))
    }

    pub fn is_contract_call(&self) -> bool {
        matches!(self.kind, TransactionKind::ContractCall(_))
    }

    /// Coinbase and contract transactions skip fee and UTXO checks
    pub fn is_special(&self) -> bool {
        self.kind != TransactionKind::Transfer
    }

    /// Gas limit requested by a contract transaction
    pub fn gas_limit(&self) -> Option<u64> {
        match &self.kind {
            TransactionKind::ContractDeploy(deploy) => Some(deploy.gas_limit),
            TransactionKind::ContractCall(call) => Some(call.gas_limit),
            TransactionKind::Transfer | TransactionKind::Coinbase { .. } => None,
        }
    }

    /// Checks that every output amount is finite and non-negative
    ///
    /// Transfer outputs must also be strictly positive; the zero-valued
    /// marker output of a contract deployment is the only empty output.
    pub fn check_outputs(&self) -> Result<(), TransactionError> {
        let transfer = self.kind == TransactionKind::Transfer;
        for (index, output) in self.outputs.iter().enumerate() {
            let amount = output.amount;
            let valid = amount.is_finite() && if transfer { amount > 0.0 } else { amount >= 0.0 };
            if !valid {
                return Err(TransactionError::InvalidOutputAmount { index, amount });
            }
        }
        Ok(())
    }

    pub fn output_sum(&self) -> f64 {
        self.outputs.iter().map(|output| output.amount).sum()
    }

    /// Size of the JSON wire encoding in bytes
    pub fn serialized_size(&self) -> usize {
        // Serializing a transaction cannot fail; if it ever did, treat it as oversized.
        serde_json::to_vec(self)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX)
    }
}
