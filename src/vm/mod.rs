// Contract virtual machine
//
// Contracts are typed instruction lists run by a small stack interpreter.
// Every instruction is charged against a gas meter before it executes, and
// contract storage is the only state a contract can reach.

pub mod gas;
pub mod interpreter;

pub use gas::{costs, suggested_gas_price, GasMeter, GasOperation, GasReport};
pub use interpreter::{
    estimate_gas, execute, ContractCode, ContractState, Execution, ExecutionContext, Instruction,
    Value, VmError, ESTIMATE_GAS_LIMIT,
};
