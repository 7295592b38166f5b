use serde::{Deserialize, Serialize};

use super::VmError;

/// Fixed gas price of each abstract operation category
///
/// Storage writes are the most expensive category so that persistent state
/// growth always costs more than computation.
pub mod costs {
    // Arithmetic
    pub const ADD: u64 = 3;
    pub const SUB: u64 = 3;
    pub const MUL: u64 = 5;
    pub const DIV: u64 = 5;
    pub const MOD: u64 = 5;
    pub const EXP: u64 = 10;

    // Comparison and logic
    pub const LT: u64 = 3;
    pub const GT: u64 = 3;
    pub const EQ: u64 = 3;
    pub const ISZERO: u64 = 3;
    pub const AND: u64 = 3;
    pub const OR: u64 = 3;
    pub const NOT: u64 = 3;

    // Memory, charged per element touched
    pub const MLOAD: u64 = 3;
    pub const MSTORE: u64 = 3;

    // Storage
    pub const SLOAD: u64 = 200;
    pub const SSTORE: u64 = 5000;

    // Control flow
    pub const JUMP: u64 = 8;
    pub const JUMPI: u64 = 10;

    // Stack
    pub const POP: u64 = 2;
    pub const PUSH: u64 = 3;
    pub const DUP: u64 = 3;
    pub const SWAP: u64 = 3;

    // Context
    pub const CALLER: u64 = 2;
    pub const CALLVALUE: u64 = 2;
    pub const TIMESTAMP: u64 = 2;
    pub const NUMBER: u64 = 2;

    // Calls
    pub const CALL: u64 = 700;
    pub const RETURN: u64 = 0;

    pub const LOG: u64 = 375;
}

/// Base price of one gas unit when the mempool is empty
const BASE_GAS_PRICE: f64 = 0.00001;

/// Gas charged for one operation category over an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasOperation {
    pub operation: String,
    pub count: u64,
    pub gas: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasReport {
    pub gas_limit: u64,
    pub gas_used: u64,
    pub gas_remaining: u64,
    pub operations: Vec<GasOperation>,
}

/// Monotonic gas counter against a fixed limit
///
/// Charges are aggregated per operation category in first-seen order, so the
/// log stays as small as the instruction set however long a program runs.
#[derive(Debug, Clone)]
pub struct GasMeter {
    limit: u64,
    used: u64,
    operations: Vec<GasOperation>,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        GasMeter {
            limit,
            used: 0,
            operations: Vec::new(),
        }
    }

    /// Adds `amount` to the counter, failing the moment it passes the limit
    ///
    /// The charge is recorded even when it fails; spent gas is never refunded.
    pub fn charge(&mut self, amount: u64, operation: &str) -> Result<(), VmError> {
        self.used = self.used.saturating_add(amount);
        match self.operations.iter_mut().find(|entry| entry.operation == operation) {
            Some(entry) => {
                entry.count += 1;
                entry.gas = entry.gas.saturating_add(amount);
            }
            None => self.operations.push(GasOperation {
                operation: operation.to_string(),
                count: 1,
                gas: amount,
            }),
        }

        if self.used > self.limit {
            return Err(VmError::OutOfGas {
                used: self.used,
                limit: self.limit,
            });
        }
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn report(&self) -> GasReport {
        GasReport {
            gas_limit: self.limit,
            gas_used: self.used,
            gas_remaining: self.remaining(),
            operations: self.operations.clone(),
        }
    }
}

/// Gas price scaled up by mempool utilization (a percentage, 0 to 100)
pub fn suggested_gas_price(utilization_percent: f64) -> f64 {
    BASE_GAS_PRICE * (1.0 + utilization_percent / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_within_limit() {
        let mut meter = GasMeter::new(100);
        meter.charge(costs::ADD, "ADD").unwrap();
        meter.charge(costs::MUL, "MUL").unwrap();

        assert_eq!(meter.used(), 8);
        assert_eq!(meter.remaining(), 92);

        let report = meter.report();
        assert_eq!(report.operations.len(), 2);
        assert_eq!(report.operations[1].operation, "MUL");
        assert_eq!(report.operations[1].gas, costs::MUL);
    }

    #[test]
    fn test_repeated_operations_are_aggregated() {
        let mut meter = GasMeter::new(1_000_000);
        meter.charge(costs::CALL, "contract_execution").unwrap();
        for _ in 0..10_000 {
            meter.charge(costs::JUMP, "JUMP").unwrap();
        }

        let report = meter.report();
        assert_eq!(report.operations.len(), 2);
        assert_eq!(report.operations[0].operation, "contract_execution");
        assert_eq!(report.operations[1].count, 10_000);
        assert_eq!(report.operations[1].gas, 10_000 * costs::JUMP);
        assert_eq!(report.gas_used, costs::CALL + 10_000 * costs::JUMP);
    }

    #[test]
    fn test_charge_exactly_to_limit_is_allowed() {
        let mut meter = GasMeter::new(10);
        meter.charge(10, "EXP").unwrap();
        assert_eq!(meter.remaining(), 0);
    }

    #[test]
    fn test_out_of_gas_keeps_spent_gas() {
        let mut meter = GasMeter::new(300);
        meter.charge(costs::SLOAD, "SLOAD").unwrap();

        let err = meter.charge(costs::SLOAD, "SLOAD").unwrap_err();
        assert!(matches!(err, VmError::OutOfGas { used: 400, limit: 300 }));
        assert_eq!(meter.used(), 400);
        assert_eq!(meter.remaining(), 0);
    }

    #[test]
    fn test_storage_write_is_most_expensive() {
        let all = [
            costs::ADD, costs::MUL, costs::EXP, costs::LT, costs::MLOAD, costs::SLOAD,
            costs::JUMPI, costs::CALL, costs::LOG,
        ];
        assert!(all.iter().all(|&cost| cost < costs::SSTORE));
    }

    #[test]
    fn test_suggested_gas_price() {
        assert_eq!(suggested_gas_price(0.0), BASE_GAS_PRICE);
        assert!((suggested_gas_price(50.0) - BASE_GAS_PRICE * 1.5).abs() < 1e-15);
    }
}
