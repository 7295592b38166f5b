use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::{HashMap, HashSet};

use super::transaction::{Transaction, TransactionError};
use super::utxo::{UtxoKey, UtxoView};
use crate::config::MempoolConfig;

/// Priority given to coinbase and contract transactions
pub const SPECIAL_PRIORITY: f64 = 1_000_000.0;

/// Age contributes at most this many priority points
const MAX_AGE_SCORE: f64 = 10.0;

const MILLIS_PER_HOUR: f64 = 60.0 * 60.0 * 1000.0;

/// A replacement must beat the original fee rate by more than this factor
const REPLACEMENT_FACTOR: f64 = 1.1;

/// Errors that can occur when admitting or replacing transactions
#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("Transaction already in mempool: {0}")]
    AlreadyPresent(String),

    #[error("Malformed transaction: {0}")]
    Malformed(#[from] TransactionError),

    #[error("UTXO not found: {0}")]
    UnknownUtxo(UtxoKey),

    #[error("UTXO already spent: {0}")]
    DoubleSpend(UtxoKey),

    #[error("Insufficient funds: inputs {inputs}, outputs {outputs}")]
    InsufficientFunds { inputs: f64, outputs: f64 },

    #[error("Fee rate too low. Minimum: {minimum}, provided: {provided:.6}")]
    FeeRateTooLow { minimum: f64, provided: f64 },

    #[error("Mempool is full")]
    Full,

    #[error("Original transaction not found: {0}")]
    NotFound(String),

    #[error("New transaction must use same inputs")]
    InputsMismatch,

    #[error("New fee rate must be more than 10% higher. Old: {old:.6}, New: {new:.6}")]
    ReplacementFeeTooLow { old: f64, new: f64 },
}

/// A pending transaction with its admission metadata
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub transaction: Transaction,
    pub added_at: i64,
    pub priority: f64,
    pub fee_rate: f64,
    pub input_sum: f64,
    pub output_sum: f64,
    sequence: u64,
}

impl MempoolEntry {
    pub fn fee(&self) -> f64 {
        self.input_sum - self.output_sum
    }
}

/// Outcome of a successful admission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub priority: f64,
    pub fee_rate: f64,
    /// One-based rank in mining order
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolStats {
    pub count: usize,
    pub total_fees: f64,
    pub total_size: usize,
    pub avg_fee_rate: f64,
    pub max_size: usize,
    /// Percentage of capacity in use
    pub utilization: f64,
}

/// Fee per serialized byte
pub fn fee_rate(transaction: &Transaction, input_sum: f64, output_sum: f64) -> f64 {
    (input_sum - output_sum) / transaction.serialized_size() as f64
}

/// Fee rate dominates; age in hours, capped, breaks ties in favour of older transactions
pub fn priority(fee_rate: f64, transaction: &Transaction, now: i64) -> f64 {
    let age_hours = (now - transaction.timestamp()).max(0) as f64 / MILLIS_PER_HOUR;
    fee_rate * 1000.0 + age_hours.min(MAX_AGE_SCORE)
}

/// Replace-by-fee threshold: strictly more than 10% above the original rate
pub fn replacement_allowed(old_fee_rate: f64, new_fee_rate: f64) -> bool {
    new_fee_rate > old_fee_rate * REPLACEMENT_FACTOR
}

/// Fee-prioritized pool of transactions waiting to be mined
///
/// Every UTXO consumed by a held value transfer is reserved in `spent`, and
/// a reservation exists only while its transaction is held.
#[derive(Debug)]
pub struct Mempool {
    entries: HashMap<String, MempoolEntry>,
    spent: HashSet<UtxoKey>,
    next_sequence: u64,
    config: MempoolConfig,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Mempool {
            entries: HashMap::new(),
            spent: HashSet::new(),
            next_sequence: 0,
            config,
        }
    }

    /// Validates and admits a transaction
    ///
    /// Checking the inputs and reserving them happen in the same call, so no
    /// two held transactions can ever consume the same UTXO.
    pub fn add<V: UtxoView>(&mut self, transaction: Transaction, utxos: &V) -> Result<Admission, MempoolError> {
        let hash = transaction.hash().to_string();
        if self.entries.contains_key(&hash) {
            return Err(MempoolError::AlreadyPresent(hash));
        }
        transaction.check_outputs()?;

        if transaction.is_special() {
            self.make_room()?;
            self.insert(transaction, SPECIAL_PRIORITY, 0.0, 0.0, 0.0);
            return Ok(self.admission(&hash));
        }

        let mut seen = HashSet::new();
        let mut input_sum = 0.0;
        for input in transaction.inputs() {
            let key = input.utxo_key();
            let utxo = utxos
                .utxo(&key)
                .ok_or_else(|| MempoolError::UnknownUtxo(key.clone()))?;
            if self.spent.contains(&key) || !seen.insert(key.clone()) {
                return Err(MempoolError::DoubleSpend(key));
            }
            input_sum += utxo.amount;
        }

        let output_sum = transaction.output_sum();
        if input_sum < output_sum {
            return Err(MempoolError::InsufficientFunds {
                inputs: input_sum,
                outputs: output_sum,
            });
        }

        let rate = fee_rate(&transaction, input_sum, output_sum);
        if rate < self.config.min_fee_rate {
            return Err(MempoolError::FeeRateTooLow {
                minimum: self.config.min_fee_rate,
                provided: rate,
            });
        }

        let priority = priority(rate, &transaction, Utc::now().timestamp_millis());

        self.make_room()?;
        self.spent.extend(seen);
        self.insert(transaction, priority, rate, input_sum, output_sum);

        Ok(self.admission(&hash))
    }

    fn insert(&mut self, transaction: Transaction, priority: f64, fee_rate: f64, input_sum: f64, output_sum: f64) {
        let entry = MempoolEntry {
            transaction,
            added_at: Utc::now().timestamp_millis(),
            priority,
            fee_rate,
            input_sum,
            output_sum,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.entries.insert(entry.transaction.hash().to_string(), entry);
    }

    fn admission(&self, hash: &str) -> Admission {
        let entry = &self.entries[hash];
        Admission {
            priority: entry.priority,
            fee_rate: entry.fee_rate,
            position: self.position(hash).unwrap_or(0),
        }
    }

    /// Evicts the lowest-priority entry when the pool is at capacity
    fn make_room(&mut self) -> Result<(), MempoolError> {
        if self.entries.len() < self.config.max_size {
            return Ok(());
        }

        let lowest = self.lowest_priority().map(|tx| tx.hash().to_string());
        if let Some(hash) = lowest {
            self.remove(&hash);
            info!("Evicted lowest-priority transaction {}", hash);
        }

        if self.entries.len() >= self.config.max_size {
            return Err(MempoolError::Full);
        }
        Ok(())
    }

    /// Removes a transaction and frees its reservations
    pub fn remove(&mut self, hash: &str) -> Option<MempoolEntry> {
        let entry = self.entries.remove(hash)?;
        if !entry.transaction.is_special() {
            for input in entry.transaction.inputs() {
                self.spent.remove(&input.utxo_key());
            }
        }
        Some(entry)
    }

    pub fn get(&self, hash: &str) -> Option<&Transaction> {
        self.entries.get(hash).map(|entry| &entry.transaction)
    }

    pub fn entry(&self, hash: &str) -> Option<&MempoolEntry> {
        self.entries.get(hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    /// Whether a held transaction already consumes this output
    pub fn is_reserved(&self, key: &UtxoKey) -> bool {
        self.spent.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sorted_entries(&self) -> Vec<&MempoolEntry> {
        let mut sorted: Vec<&MempoolEntry> = self.entries.values().collect();
        sorted.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then(a.sequence.cmp(&b.sequence))
        });
        sorted
    }

    /// Held transactions, highest priority first
    pub fn transactions_by_priority(&self, limit: Option<usize>) -> Vec<Transaction> {
        self.sorted_entries()
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|entry| entry.transaction.clone())
            .collect()
    }

    /// One-based rank of a transaction in mining order
    pub fn position(&self, hash: &str) -> Option<usize> {
        self.sorted_entries()
            .iter()
            .position(|entry| entry.transaction.hash() == hash)
            .map(|index| index + 1)
    }

    pub fn lowest_priority(&self) -> Option<&Transaction> {
        self.entries
            .values()
            .min_by(|a, b| {
                a.priority
                    .total_cmp(&b.priority)
                    .then(b.sequence.cmp(&a.sequence))
            })
            .map(|entry| &entry.transaction)
    }

    /// Greedy selection in priority order under a count and byte budget
    ///
    /// Stops at the first transaction that would exceed either bound.
    pub fn get_for_mining(&self, max_count: usize, max_bytes: usize) -> Vec<Transaction> {
        let mut selected = Vec::new();
        let mut size = 0usize;

        for entry in self.sorted_entries() {
            let tx_size = entry.transaction.serialized_size();
            if selected.len() >= max_count || size.saturating_add(tx_size) > max_bytes {
                break;
            }
            selected.push(entry.transaction.clone());
            size += tx_size;
        }

        selected
    }

    /// Replace-by-fee
    ///
    /// The replacement must spend exactly the same outputs and pay a fee rate
    /// more than 10% higher. The original is dropped, with its reservations,
    /// before the replacement is admitted; if admission fails the original is
    /// restored.
    pub fn replace<V: UtxoView>(
        &mut self,
        old_hash: &str,
        transaction: Transaction,
        utxos: &V,
    ) -> Result<Admission, MempoolError> {
        transaction.check_outputs()?;
        let old = self
            .entries
            .get(old_hash)
            .ok_or_else(|| MempoolError::NotFound(old_hash.to_string()))?;

        let old_inputs: HashSet<UtxoKey> = old.transaction.inputs().iter().map(|i| i.utxo_key()).collect();
        let new_inputs: HashSet<UtxoKey> = transaction.inputs().iter().map(|i| i.utxo_key()).collect();
        if old_inputs != new_inputs || transaction.inputs().len() != new_inputs.len() {
            return Err(MempoolError::InputsMismatch);
        }

        let input_sum: f64 = new_inputs
            .iter()
            .filter_map(|key| utxos.utxo(key))
            .map(|utxo| utxo.amount)
            .sum();
        let new_rate = fee_rate(&transaction, input_sum, transaction.output_sum());
        if !replacement_allowed(old.fee_rate, new_rate) {
            return Err(MempoolError::ReplacementFeeTooLow {
                old: old.fee_rate,
                new: new_rate,
            });
        }

        let Some(original) = self.remove(old_hash) else {
            return Err(MempoolError::NotFound(old_hash.to_string()));
        };

        match self.add(transaction, utxos) {
            Ok(admission) => {
                debug!("Replaced {} by fee", old_hash);
                Ok(admission)
            }
            Err(err) => {
                self.spent.extend(original.transaction.inputs().iter().map(|i| i.utxo_key()));
                self.entries.insert(old_hash.to_string(), original);
                Err(err)
            }
        }
    }

    /// Drops transactions spending outputs that are no longer in the index
    ///
    /// Returns the number of transactions removed.
    pub fn cleanup_invalid<V: UtxoView>(&mut self, utxos: &V) -> usize {
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|entry| !entry.transaction.is_special())
            .filter(|entry| {
                entry
                    .transaction
                    .inputs()
                    .iter()
                    .any(|input| !utxos.contains_utxo(&input.utxo_key()))
            })
            .map(|entry| entry.transaction.hash().to_string())
            .collect();

        for hash in &stale {
            self.remove(hash);
        }

        if !stale.is_empty() {
            info!("Removed {} invalid transactions from mempool", stale.len());
        }
        stale.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.spent.clear();
    }

    pub fn stats(&self) -> MempoolStats {
        let mut total_fees = 0.0;
        let mut total_size = 0;
        for entry in self.entries.values() {
            total_fees += entry.fee();
            total_size += entry.transaction.serialized_size();
        }

        let avg_fee_rate = if total_size > 0 {
            total_fees / total_size as f64
        } else {
            0.0
        };
        let utilization = if self.config.max_size > 0 {
            self.entries.len() as f64 / self.config.max_size as f64 * 100.0
        } else {
            100.0
        };

        MempoolStats {
            count: self.entries.len(),
            total_fees,
            total_size,
            avg_fee_rate,
            max_size: self.config.max_size,
            utilization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Address;
    use crate::blockchain::transaction::{TransactionInput, TransactionOutput};
    use crate::blockchain::utxo::{Utxo, UtxoSet};
    use crate::vm::ContractCode;

    fn funded(count: u32) -> UtxoSet {
        let mut utxos = UtxoSet::new();
        for index in 0..count {
            utxos.insert(Utxo {
                tx_hash: "f".repeat(64),
                output_index: index,
                address: Address::from("alice"),
                amount: 1000.0,
            });
        }
        utxos
    }

    fn spend(indices: &[u32], output: f64) -> Transaction {
        Transaction::new(
            indices
                .iter()
                .map(|&index| TransactionInput::new("f".repeat(64), index))
                .collect(),
            vec![TransactionOutput::new(Address::from("bob"), output)],
        )
    }

    fn pool() -> Mempool {
        Mempool::new(MempoolConfig::default())
    }

    #[test]
    fn test_add_reserves_inputs() {
        let utxos = funded(1);
        let mut mempool = pool();
        let tx = spend(&[0], 990.0);

        let admission = mempool.add(tx.clone(), &utxos).unwrap();

        assert_eq!(admission.position, 1);
        assert!(admission.fee_rate > 0.0);
        assert!(mempool.is_reserved(&UtxoKey::new("f".repeat(64), 0)));
        assert_eq!(mempool.entry(tx.hash()).unwrap().fee(), 10.0);
    }

    #[test]
    fn test_duplicate_is_already_present() {
        let utxos = funded(1);
        let mut mempool = pool();
        let tx = spend(&[0], 990.0);

        mempool.add(tx.clone(), &utxos).unwrap();
        let err = mempool.add(tx, &utxos).unwrap_err();

        assert!(matches!(err, MempoolError::AlreadyPresent(_)));
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn test_negative_output_is_malformed() {
        let utxos = funded(1);
        let mut mempool = pool();
        let tx = Transaction::new(
            vec![TransactionInput::new("f".repeat(64), 0)],
            vec![
                TransactionOutput::new(Address::from("mallory"), 1_000_000.0),
                TransactionOutput::new(Address::from("sink"), -999_010.0),
            ],
        );

        let err = mempool.add(tx, &utxos).unwrap_err();

        assert!(matches!(
            err,
            MempoolError::Malformed(TransactionError::InvalidOutputAmount { index: 1, .. })
        ));
        assert!(mempool.is_empty());
        assert!(!mempool.is_reserved(&UtxoKey::new("f".repeat(64), 0)));
    }

    #[test]
    fn test_double_spend_rejected_before_mining() {
        let utxos = funded(1);
        let mut mempool = pool();

        mempool.add(spend(&[0], 990.0), &utxos).unwrap();
        let err = mempool.add(spend(&[0], 980.0), &utxos).unwrap_err();

        assert!(matches!(err, MempoolError::DoubleSpend(_)));
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn test_same_input_twice_in_one_transaction() {
        let utxos = funded(1);
        let mut mempool = pool();

        let err = mempool.add(spend(&[0, 0], 1500.0), &utxos).unwrap_err();
        assert!(matches!(err, MempoolError::DoubleSpend(_)));
        assert!(!mempool.is_reserved(&UtxoKey::new("f".repeat(64), 0)));
    }

    #[test]
    fn test_rejections() {
        let utxos = funded(1);
        let mut mempool = pool();

        let unknown = spend(&[7], 10.0);
        assert!(matches!(mempool.add(unknown, &utxos), Err(MempoolError::UnknownUtxo(_))));

        let overspend = spend(&[0], 1000.5);
        assert!(matches!(
            mempool.add(overspend, &utxos),
            Err(MempoolError::InsufficientFunds { .. })
        ));

        let stingy = spend(&[0], 999.99);
        assert!(matches!(
            mempool.add(stingy, &utxos),
            Err(MempoolError::FeeRateTooLow { .. })
        ));

        assert!(mempool.is_empty());
        assert!(!mempool.is_reserved(&UtxoKey::new("f".repeat(64), 0)));
    }

    #[test]
    fn test_special_transactions_bypass_fee_checks() {
        let utxos = funded(0);
        let mut mempool = pool();
        let deploy = Transaction::contract_deploy(Address::from("alice"), ContractCode::new(), 100_000, 0.0);

        let admission = mempool.add(deploy, &utxos).unwrap();
        assert_eq!(admission.priority, SPECIAL_PRIORITY);
    }

    #[test]
    fn test_fee_rate_orders_mining() {
        let utxos = funded(2);
        let mut mempool = pool();
        let low = spend(&[0], 990.0);
        let high = spend(&[1], 980.0);

        mempool.add(low.clone(), &utxos).unwrap();
        mempool.add(high.clone(), &utxos).unwrap();

        let selected = mempool.get_for_mining(10, 1_000_000);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].hash(), high.hash());
        assert_eq!(selected[1].hash(), low.hash());
        assert_eq!(mempool.position(high.hash()), Some(1));
    }

    #[test]
    fn test_mining_selection_respects_budgets() {
        let utxos = funded(3);
        let mut mempool = pool();
        for (index, output) in [(0, 990.0), (1, 980.0), (2, 970.0)] {
            mempool.add(spend(&[index], output), &utxos).unwrap();
        }

        assert_eq!(mempool.get_for_mining(2, 1_000_000).len(), 2);

        let one_size = spend(&[0], 990.0).serialized_size();
        assert_eq!(mempool.get_for_mining(10, one_size + 10).len(), 1);
        assert!(mempool.get_for_mining(10, 10).is_empty());
    }

    #[test]
    fn test_eviction_when_full() {
        let utxos = funded(3);
        let mut mempool = Mempool::new(MempoolConfig {
            max_size: 2,
            min_fee_rate: 0.001,
        });
        let cheapest = spend(&[0], 990.0);

        mempool.add(cheapest.clone(), &utxos).unwrap();
        mempool.add(spend(&[1], 980.0), &utxos).unwrap();
        mempool.add(spend(&[2], 970.0), &utxos).unwrap();

        assert_eq!(mempool.len(), 2);
        assert!(!mempool.contains(cheapest.hash()));
        assert!(!mempool.is_reserved(&UtxoKey::new("f".repeat(64), 0)));
    }

    #[test]
    fn test_zero_capacity_is_full() {
        let utxos = funded(1);
        let mut mempool = Mempool::new(MempoolConfig {
            max_size: 0,
            min_fee_rate: 0.001,
        });

        assert!(matches!(mempool.add(spend(&[0], 990.0), &utxos), Err(MempoolError::Full)));
        assert!(!mempool.is_reserved(&UtxoKey::new("f".repeat(64), 0)));
    }

    #[test]
    fn test_replacement_threshold_is_strict() {
        assert!(!replacement_allowed(1.0, 1.1));
        assert!(!replacement_allowed(2.0, 2.2));
        assert!(replacement_allowed(1.0, 1.11));
        assert!(!replacement_allowed(1.0, 1.05));
    }

    #[test]
    fn test_replace_by_fee() {
        let utxos = funded(1);
        let mut mempool = pool();
        let original = spend(&[0], 990.0);
        mempool.add(original.clone(), &utxos).unwrap();

        let timid = spend(&[0], 989.5);
        assert!(matches!(
            mempool.replace(original.hash(), timid, &utxos),
            Err(MempoolError::ReplacementFeeTooLow { .. })
        ));
        assert!(mempool.contains(original.hash()));

        let bold = spend(&[0], 988.0);
        mempool.replace(original.hash(), bold.clone(), &utxos).unwrap();

        assert!(!mempool.contains(original.hash()));
        assert!(mempool.contains(bold.hash()));
        assert!(mempool.is_reserved(&UtxoKey::new("f".repeat(64), 0)));
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn test_replace_requires_same_inputs() {
        let utxos = funded(2);
        let mut mempool = pool();
        let original = spend(&[0], 990.0);
        mempool.add(original.clone(), &utxos).unwrap();

        let different = spend(&[1], 900.0);
        assert!(matches!(
            mempool.replace(original.hash(), different, &utxos),
            Err(MempoolError::InputsMismatch)
        ));
        assert!(matches!(
            mempool.replace("missing", spend(&[0], 900.0), &utxos),
            Err(MempoolError::NotFound(_))
        ));
    }

    #[test]
    fn test_cleanup_invalid() {
        let mut utxos = funded(2);
        let mut mempool = pool();
        let doomed = spend(&[0], 990.0);
        let survivor = spend(&[1], 990.0);
        mempool.add(doomed.clone(), &utxos).unwrap();
        mempool.add(survivor.clone(), &utxos).unwrap();

        utxos.remove(&UtxoKey::new("f".repeat(64), 0));

        assert_eq!(mempool.cleanup_invalid(&utxos), 1);
        assert!(!mempool.contains(doomed.hash()));
        assert!(mempool.contains(survivor.hash()));
        assert!(!mempool.is_reserved(&UtxoKey::new("f".repeat(64), 0)));
    }

    #[test]
    fn test_stats() {
        let utxos = funded(2);
        let mut mempool = Mempool::new(MempoolConfig {
            max_size: 4,
            min_fee_rate: 0.001,
        });
        mempool.add(spend(&[0], 990.0), &utxos).unwrap();
        mempool.add(spend(&[1], 980.0), &utxos).unwrap();

        let stats = mempool.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_fees, 30.0);
        assert_eq!(stats.utilization, 50.0);
        assert!(stats.avg_fee_rate > 0.0);

        mempool.clear();
        assert!(mempool.is_empty());
        assert!(!mempool.is_reserved(&UtxoKey::new("f".repeat(64), 1)));
    }
}
