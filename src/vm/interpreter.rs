use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::BTreeMap;
use std::fmt;

use super::gas::{costs, GasMeter, GasReport};
use crate::blockchain::crypto::Address;

/// Gas ceiling used when estimating a call
pub const ESTIMATE_GAS_LIMIT: u64 = 10_000_000;

/// Persistent key/value storage of one contract
pub type ContractState = BTreeMap<String, Value>;

/// Errors that abort contract execution
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    #[error("Out of gas! Used {used}, limit {limit}")]
    OutOfGas { used: u64, limit: u64 },

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Stack underflow at instruction {pc}")]
    StackUnderflow { pc: usize },

    #[error("Type mismatch at instruction {pc}: expected {expected}")]
    TypeMismatch { pc: usize, expected: &'static str },

    #[error("Division by zero at instruction {pc}")]
    DivisionByZero { pc: usize },

    #[error("Jump target {target} out of range at instruction {pc}")]
    BadJump { pc: usize, target: usize },

    #[error("Requirement failed: {0}")]
    RequirementFailed(String),
}

/// A value on the stack or in contract storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Text(s) => !s.is_empty(),
        }
    }

    fn text_len(&self) -> u64 {
        self.to_string().chars().count() as u64
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// One interpreter instruction
///
/// Binary operators pop `b` then `a` and push `a op b`. `SStore` pops the
/// value then the key. Jump targets are instruction indices; jumping to the
/// end of the method finishes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Instruction {
    Push(Value),
    Pop,
    Dup,
    Swap,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Exp,
    Lt,
    Gt,
    Eq,
    IsZero,
    And,
    Or,
    Not,
    Concat,
    Param(String),
    Caller,
    CallValue,
    Timestamp,
    BlockNumber,
    SLoad,
    SStore,
    Jump(usize),
    JumpIf(usize),
    Require(String),
    Log,
    Return,
}

impl Instruction {
    /// Static cost and label; `Concat` adds a per-character charge on top
    fn cost(&self) -> (u64, &'static str) {
        match self {
            Instruction::Push(_) => (costs::PUSH, "PUSH"),
            Instruction::Pop => (costs::POP, "POP"),
            Instruction::Dup => (costs::DUP, "DUP"),
            Instruction::Swap => (costs::SWAP, "SWAP"),
            Instruction::Add => (costs::ADD, "ADD"),
            Instruction::Sub => (costs::SUB, "SUB"),
            Instruction::Mul => (costs::MUL, "MUL"),
            Instruction::Div => (costs::DIV, "DIV"),
            Instruction::Mod => (costs::MOD, "MOD"),
            Instruction::Exp => (costs::EXP, "EXP"),
            Instruction::Lt => (costs::LT, "LT"),
            Instruction::Gt => (costs::GT, "GT"),
            Instruction::Eq => (costs::EQ, "EQ"),
            Instruction::IsZero => (costs::ISZERO, "ISZERO"),
            Instruction::And => (costs::AND, "AND"),
            Instruction::Or => (costs::OR, "OR"),
            Instruction::Not => (costs::NOT, "NOT"),
            Instruction::Concat => (costs::MLOAD, "CONCAT"),
            Instruction::Param(_) => (costs::MLOAD, "PARAM"),
            Instruction::Caller => (costs::CALLER, "CALLER"),
            Instruction::CallValue => (costs::CALLVALUE, "CALLVALUE"),
            Instruction::Timestamp => (costs::TIMESTAMP, "TIMESTAMP"),
            Instruction::BlockNumber => (costs::NUMBER, "NUMBER"),
            Instruction::SLoad => (costs::SLOAD, "SLOAD"),
            Instruction::SStore => (costs::SSTORE, "SSTORE"),
            Instruction::Jump(_) => (costs::JUMP, "JUMP"),
            Instruction::JumpIf(_) => (costs::JUMPI, "JUMPI"),
            Instruction::Require(_) => (costs::JUMPI, "REQUIRE"),
            Instruction::Log => (costs::LOG, "LOG"),
            Instruction::Return => (costs::RETURN, "RETURN"),
        }
    }
}

/// Deployable contract code: named methods of instructions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractCode {
    pub methods: BTreeMap<String, Vec<Instruction>>,
}

impl ContractCode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, name: impl Into<String>, body: Vec<Instruction>) -> Self {
        self.methods.insert(name.into(), body);
        self
    }

    pub fn method(&self, name: &str) -> Option<&[Instruction]> {
        self.methods.get(name).map(Vec::as_slice)
    }
}

/// Caller and block information visible to a contract
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub caller: Address,
    pub value: f64,
    pub block_number: u64,
    pub timestamp: i64,
}

/// Result of running a contract method
///
/// Gas is reported whether or not execution succeeded; failures are never
/// refunded.
#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: Result<Value, VmError>,
    pub gas_used: u64,
    pub gas_report: GasReport,
    pub logs: Vec<Value>,
}

impl Execution {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

struct Machine<'a> {
    meter: GasMeter,
    state: &'a mut ContractState,
    params: &'a BTreeMap<String, Value>,
    context: &'a ExecutionContext,
    stack: Vec<Value>,
    logs: Vec<Value>,
}

impl<'a> Machine<'a> {
    fn pop(&mut self, pc: usize) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow { pc })
    }

    fn pop_number(&mut self, pc: usize) -> Result<f64, VmError> {
        match self.pop(pc)? {
            Value::Number(n) => Ok(n),
            _ => Err(VmError::TypeMismatch { pc, expected: "number" }),
        }
    }

    fn pop_numbers(&mut self, pc: usize) -> Result<(f64, f64), VmError> {
        let b = self.pop_number(pc)?;
        let a = self.pop_number(pc)?;
        Ok((a, b))
    }

    fn peek(&self, pc: usize) -> Result<Value, VmError> {
        self.stack.last().cloned().ok_or(VmError::StackUnderflow { pc })
    }

    fn run(&mut self, body: &[Instruction]) -> Result<Value, VmError> {
        let mut pc = 0;

        while pc < body.len() {
            let instruction = &body[pc];
            let (cost, label) = instruction.cost();
            self.meter.charge(cost, label)?;

            let mut next = pc + 1;
            match instruction {
                Instruction::Push(value) => self.stack.push(value.clone()),
                Instruction::Pop => {
                    self.pop(pc)?;
                }
                Instruction::Dup => {
                    let top = self.peek(pc)?;
                    self.stack.push(top);
                }
                Instruction::Swap => {
                    let b = self.pop(pc)?;
                    let a = self.pop(pc)?;
                    self.stack.push(b);
                    self.stack.push(a);
                }
                Instruction::Add => {
                    let (a, b) = self.pop_numbers(pc)?;
                    self.stack.push(Value::Number(a + b));
                }
                Instruction::Sub => {
                    let (a, b) = self.pop_numbers(pc)?;
                    self.stack.push(Value::Number(a - b));
                }
                Instruction::Mul => {
                    let (a, b) = self.pop_numbers(pc)?;
                    self.stack.push(Value::Number(a * b));
                }
                Instruction::Div | Instruction::Mod => {
                    let (a, b) = self.pop_numbers(pc)?;
                    if b == 0.0 {
                        return Err(VmError::DivisionByZero { pc });
                    }
                    let result = if matches!(instruction, Instruction::Div) { a / b } else { a % b };
                    self.stack.push(Value::Number(result));
                }
                Instruction::Exp => {
                    let (a, b) = self.pop_numbers(pc)?;
                    self.stack.push(Value::Number(a.powf(b)));
                }
                Instruction::Lt => {
                    let (a, b) = self.pop_numbers(pc)?;
                    self.stack.push(Value::Bool(a < b));
                }
                Instruction::Gt => {
                    let (a, b) = self.pop_numbers(pc)?;
                    self.stack.push(Value::Bool(a > b));
                }
                Instruction::Eq => {
                    let b = self.pop(pc)?;
                    let a = self.pop(pc)?;
                    self.stack.push(Value::Bool(a == b));
                }
                Instruction::IsZero => {
                    let a = self.pop_number(pc)?;
                    self.stack.push(Value::Bool(a == 0.0));
                }
                Instruction::And => {
                    let b = self.pop(pc)?;
                    let a = self.pop(pc)?;
                    self.stack.push(Value::Bool(a.is_truthy() && b.is_truthy()));
                }
                Instruction::Or => {
                    let b = self.pop(pc)?;
                    let a = self.pop(pc)?;
                    self.stack.push(Value::Bool(a.is_truthy() || b.is_truthy()));
                }
                Instruction::Not => {
                    let a = self.pop(pc)?;
                    self.stack.push(Value::Bool(!a.is_truthy()));
                }
                Instruction::Concat => {
                    let b = self.pop(pc)?;
                    let a = self.pop(pc)?;
                    self.meter
                        .charge(costs::MSTORE * (a.text_len() + b.text_len()), "CONCAT")?;
                    self.stack.push(Value::Text(format!("{}{}", a, b)));
                }
                Instruction::Param(name) => {
                    let value = self.params.get(name).cloned().unwrap_or(Value::Null);
                    self.stack.push(value);
                }
                Instruction::Caller => {
                    self.stack.push(Value::Text(self.context.caller.to_string()));
                }
                Instruction::CallValue => self.stack.push(Value::Number(self.context.value)),
                Instruction::Timestamp => {
                    self.stack.push(Value::Number(self.context.timestamp as f64));
                }
                Instruction::BlockNumber => {
                    self.stack.push(Value::Number(self.context.block_number as f64));
                }
                Instruction::SLoad => {
                    let key = self.pop(pc)?.to_string();
                    let value = self.state.get(&key).cloned().unwrap_or(Value::Null);
                    self.stack.push(value);
                }
                Instruction::SStore => {
                    let value = self.pop(pc)?;
                    let key = self.pop(pc)?.to_string();
                    self.state.insert(key, value);
                }
                Instruction::Jump(target) => {
                    next = self.jump_target(pc, *target, body.len())?;
                }
                Instruction::JumpIf(target) => {
                    let target = self.jump_target(pc, *target, body.len())?;
                    if self.pop(pc)?.is_truthy() {
                        next = target;
                    }
                }
                Instruction::Require(message) => {
                    if !self.pop(pc)?.is_truthy() {
                        return Err(VmError::RequirementFailed(message.clone()));
                    }
                }
                Instruction::Log => {
                    let value = self.pop(pc)?;
                    debug!("contract log: {}", value);
                    self.logs.push(value);
                }
                Instruction::Return => {
                    return Ok(self.stack.pop().unwrap_or(Value::Null));
                }
            }
            pc = next;
        }

        Ok(Value::Null)
    }

    fn jump_target(&self, pc: usize, target: usize, len: usize) -> Result<usize, VmError> {
        if target > len {
            return Err(VmError::BadJump { pc, target });
        }
        Ok(target)
    }
}

/// Runs `method` of `code` with metered access to `state`
///
/// Storage writes land in `state` as they happen; callers that need
/// all-or-nothing semantics pass a scratch copy and keep it only on success.
pub fn execute(
    code: &ContractCode,
    method: &str,
    state: &mut ContractState,
    params: &BTreeMap<String, Value>,
    context: &ExecutionContext,
    gas_limit: u64,
) -> Execution {
    let mut machine = Machine {
        meter: GasMeter::new(gas_limit),
        state,
        params,
        context,
        stack: Vec::new(),
        logs: Vec::new(),
    };

    let outcome = machine
        .meter
        .charge(costs::CALL, "contract_execution")
        .and_then(|_| {
            code.method(method)
                .ok_or_else(|| VmError::UnknownMethod(method.to_string()))
        })
        .and_then(|body| machine.run(body));

    Execution {
        outcome,
        gas_used: machine.meter.used(),
        gas_report: machine.meter.report(),
        logs: machine.logs,
    }
}

/// Estimates the gas a call needs, with a 20% safety margin
///
/// The call runs once against a copy of `state` under a very high ceiling.
pub fn estimate_gas(
    code: &ContractCode,
    method: &str,
    state: &ContractState,
    params: &BTreeMap<String, Value>,
    context: &ExecutionContext,
) -> Result<u64, VmError> {
    let mut scratch = state.clone();
    let execution = execute(code, method, &mut scratch, params, context, ESTIMATE_GAS_LIMIT);
    execution.outcome?;

    // ceil(used * 1.2) in integer arithmetic
    Ok((execution.gas_used * 12 + 9) / 10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use Instruction::*;

    fn context() -> ExecutionContext {
        ExecutionContext {
            caller: Address::from("alice"),
            value: 0.0,
            block_number: 3,
            timestamp: 1_000,
        }
    }

    fn counter() -> ContractCode {
        ContractCode::new()
            .with_method(
                "increment",
                vec![
                    Push("count".into()),
                    Push("count".into()),
                    SLoad,
                    Dup,
                    Push(Value::Null),
                    Eq,
                    JumpIf(8),
                    Jump(10),
                    // count was never written
                    Pop,
                    Push(0.0.into()),
                    Push(1.0.into()),
                    Add,
                    SStore,
                    Push("count".into()),
                    SLoad,
                    Return,
                ],
            )
            .with_method("get", vec![Push("count".into()), SLoad, Return])
    }

    fn run(code: &ContractCode, method: &str, state: &mut ContractState, gas: u64) -> Execution {
        execute(code, method, state, &BTreeMap::new(), &context(), gas)
    }

    #[test]
    fn test_counter_increments_storage() {
        let code = counter();
        let mut state = ContractState::new();

        let first = run(&code, "increment", &mut state, 100_000);
        assert_eq!(first.outcome, Ok(Value::Number(1.0)));

        let second = run(&code, "increment", &mut state, 100_000);
        assert_eq!(second.outcome, Ok(Value::Number(2.0)));
        assert_eq!(state.get("count"), Some(&Value::Number(2.0)));
    }

    #[test]
    fn test_storage_access_is_metered() {
        let code = counter();
        let mut state = ContractState::new();

        let execution = run(&code, "get", &mut state, 100_000);
        assert_eq!(execution.outcome, Ok(Value::Null));
        assert_eq!(execution.gas_used, costs::CALL + costs::PUSH + costs::SLOAD + costs::RETURN);
        assert_eq!(execution.gas_report.operations[0].operation, "contract_execution");
    }

    #[test]
    fn test_out_of_gas_in_infinite_loop() {
        let code = ContractCode::new().with_method("spin", vec![Jump(0)]);
        let mut state = ContractState::new();
        let limit = 5_000;

        let execution = run(&code, "spin", &mut state, limit);

        assert!(!execution.is_success());
        assert!(matches!(execution.outcome, Err(VmError::OutOfGas { .. })));
        assert!(execution.gas_used > limit);
        assert!(execution.gas_used <= limit + costs::JUMP);
        assert_eq!(execution.gas_report.gas_remaining, 0);
    }

    #[test]
    fn test_out_of_gas_on_storage_write() {
        let code = ContractCode::new().with_method(
            "write",
            vec![Push("k".into()), Push(1.0.into()), SStore],
        );
        let mut state = ContractState::new();

        let execution = run(&code, "write", &mut state, 1_000);
        assert!(matches!(execution.outcome, Err(VmError::OutOfGas { limit: 1_000, .. })));
    }

    #[test]
    fn test_require_and_params() {
        let code = ContractCode::new().with_method(
            "guarded",
            vec![
                Param("amount".to_string()),
                Push(10.0.into()),
                Gt,
                Require("amount too small".to_string()),
                Caller,
                Return,
            ],
        );
        let mut state = ContractState::new();

        let mut params = BTreeMap::new();
        params.insert("amount".to_string(), Value::Number(50.0));
        let ok = execute(&code, "guarded", &mut state, &params, &context(), 10_000);
        assert_eq!(ok.outcome, Ok(Value::Text("alice".to_string())));

        params.insert("amount".to_string(), Value::Number(5.0));
        let failed = execute(&code, "guarded", &mut state, &params, &context(), 10_000);
        assert_eq!(
            failed.outcome,
            Err(VmError::RequirementFailed("amount too small".to_string()))
        );
        assert!(failed.gas_used > 0);
    }

    #[test]
    fn test_execution_errors() {
        let mut state = ContractState::new();

        let underflow = ContractCode::new().with_method("m", vec![Add]);
        assert_eq!(
            run(&underflow, "m", &mut state, 10_000).outcome,
            Err(VmError::StackUnderflow { pc: 0 })
        );

        let div = ContractCode::new().with_method("m", vec![Push(1.0.into()), Push(0.0.into()), Div]);
        assert_eq!(
            run(&div, "m", &mut state, 10_000).outcome,
            Err(VmError::DivisionByZero { pc: 2 })
        );

        let mismatch = ContractCode::new().with_method("m", vec![Push("a".into()), Push(1.0.into()), Add]);
        assert!(matches!(
            run(&mismatch, "m", &mut state, 10_000).outcome,
            Err(VmError::TypeMismatch { pc: 2, .. })
        ));

        let jump = ContractCode::new().with_method("m", vec![Jump(5)]);
        assert_eq!(
            run(&jump, "m", &mut state, 10_000).outcome,
            Err(VmError::BadJump { pc: 0, target: 5 })
        );

        assert_eq!(
            run(&jump, "missing", &mut state, 10_000).outcome,
            Err(VmError::UnknownMethod("missing".to_string()))
        );
    }

    #[test]
    fn test_concat_and_logs() {
        let code = ContractCode::new().with_method(
            "key",
            vec![Push("balance:".into()), Caller, Concat, Dup, Log, Return],
        );
        let mut state = ContractState::new();

        let execution = run(&code, "key", &mut state, 10_000);
        assert_eq!(execution.outcome, Ok(Value::Text("balance:alice".to_string())));
        assert_eq!(execution.logs, vec![Value::Text("balance:alice".to_string())]);
    }

    #[test]
    fn test_estimate_gas_adds_margin_without_touching_state() {
        let code = counter();
        let state = ContractState::new();

        let mut scratch = state.clone();
        let actual = run(&code, "increment", &mut scratch, ESTIMATE_GAS_LIMIT).gas_used;
        let estimate = estimate_gas(&code, "increment", &state, &BTreeMap::new(), &context()).unwrap();

        assert_eq!(estimate, (actual as f64 * 1.2).ceil() as u64);
        assert!(state.is_empty());
    }

    #[test]
    fn test_code_wire_format() {
        let code = ContractCode::new().with_method("m", vec![Push(1.0.into()), Jump(0), Return]);
        let json = serde_json::to_value(&code).unwrap();

        assert_eq!(json["methods"]["m"][0]["op"], "PUSH");
        assert_eq!(json["methods"]["m"][0]["arg"], 1.0);
        assert_eq!(json["methods"]["m"][2]["op"], "RETURN");

        let decoded: ContractCode = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, code);
    }
}
