use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use std::collections::{BTreeMap, HashMap};

use super::crypto::{hash_value, Address};
use super::transaction::{ContractCall, ContractDeploy};
use crate::vm::{self, ContractCode, ContractState, Execution, ExecutionContext, Value, VmError};

/// Errors that can occur when deploying or calling contracts
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Contract not found: {0}")]
    NotFound(String),

    #[error("Contract already deployed at {0}")]
    AlreadyDeployed(String),

    #[error("Contract execution failed after {gas_used} gas: {error}")]
    ExecutionFailed { error: VmError, gas_used: u64 },
}

/// A deployed contract and its persistent state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub code: ContractCode,
    pub deployer: Address,
    pub state: ContractState,
    pub balance: f64,
    pub gas_used_total: u64,
    pub call_count: u64,
}

/// Deterministic address of a contract from its code, deployer and deploy time
pub fn contract_address(deploy: &ContractDeploy, timestamp: i64) -> String {
    hash_value(&json!({
        "code": deploy.code,
        "deployer": deploy.from,
        "timestamp": timestamp,
    }))
}

/// All deployed contracts, keyed by address
#[derive(Debug, Clone, Default)]
pub struct ContractStore {
    contracts: HashMap<String, Contract>,
}

impl ContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &str) -> Option<&Contract> {
        self.contracts.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Contract)> {
        self.contracts.iter()
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Registers a new contract, returning its address
    pub fn deploy(&mut self, deploy: &ContractDeploy, timestamp: i64) -> Result<String, ContractError> {
        let address = contract_address(deploy, timestamp);
        if self.contracts.contains_key(&address) {
            return Err(ContractError::AlreadyDeployed(address));
        }

        self.contracts.insert(
            address.clone(),
            Contract {
                code: deploy.code.clone(),
                deployer: deploy.from.clone(),
                state: ContractState::new(),
                balance: 0.0,
                gas_used_total: 0,
                call_count: 0,
            },
        );

        info!("Contract deployed at: {}", address);
        Ok(address)
    }

    /// Runs a contract call under its gas limit
    ///
    /// The call works on a copy of the contract state which replaces the
    /// stored state only if execution succeeds.
    pub fn call(&mut self, call: &ContractCall, block_number: u64, timestamp: i64) -> Result<Execution, ContractError> {
        let contract = self
            .contracts
            .get_mut(&call.contract_address)
            .ok_or_else(|| ContractError::NotFound(call.contract_address.clone()))?;

        let context = ExecutionContext {
            caller: call.from.clone(),
            value: 0.0,
            block_number,
            timestamp,
        };
        let mut scratch = contract.state.clone();
        let execution = vm::execute(
            &contract.code,
            &call.method,
            &mut scratch,
            &call.params,
            &context,
            call.gas_limit,
        );

        if let Err(error) = &execution.outcome {
            return Err(ContractError::ExecutionFailed {
                error: error.clone(),
                gas_used: execution.gas_used,
            });
        }

        contract.state = scratch;
        contract.gas_used_total += execution.gas_used;
        contract.call_count += 1;

        debug!(
            "Contract {} executed {} using {} gas",
            call.contract_address, call.method, execution.gas_used
        );
        Ok(execution)
    }

    /// Gas estimate for a call, without changing any state
    pub fn estimate_gas(
        &self,
        address: &str,
        method: &str,
        params: &BTreeMap<String, Value>,
        context: &ExecutionContext,
    ) -> Result<u64, ContractError> {
        let contract = self
            .contracts
            .get(address)
            .ok_or_else(|| ContractError::NotFound(address.to_string()))?;

        vm::estimate_gas(&contract.code, method, &contract.state, params, context).map_err(|error| {
            ContractError::ExecutionFailed {
                error,
                gas_used: vm::ESTIMATE_GAS_LIMIT,
            }
        })
    }
}
