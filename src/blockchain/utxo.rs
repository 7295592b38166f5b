use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::fmt;

use super::crypto::Address;

/// Composite key of an output: the transaction that created it and its position
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoKey {
    pub tx_hash: String,
    pub output_index: u32,
}

impl UtxoKey {
    pub fn new(tx_hash: impl Into<String>, output_index: u32) -> Self {
        UtxoKey {
            tx_hash: tx_hash.into(),
            output_index,
        }
    }
}

impl fmt::Display for UtxoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.output_index)
    }
}

/// An unspent transaction output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub tx_hash: String,
    pub output_index: u32,
    pub address: Address,
    pub amount: f64,
}

impl Utxo {
    pub fn key(&self) -> UtxoKey {
        UtxoKey::new(self.tx_hash.clone(), self.output_index)
    }
}

/// Read access to spendable outputs
///
/// The mempool only ever needs to look outputs up, so it depends on this
/// view rather than on the whole ledger.
pub trait UtxoView {
    fn utxo(&self, key: &UtxoKey) -> Option<&Utxo>;

    fn contains_utxo(&self, key: &UtxoKey) -> bool {
        self.utxo(key).is_some()
    }
}

/// The UTXO index: sole source of truth for spendable value
#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    utxos: HashMap<UtxoKey, Utxo>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, utxo: Utxo) {
        self.utxos.insert(utxo.key(), utxo);
    }

    pub fn remove(&mut self, key: &UtxoKey) -> Option<Utxo> {
        self.utxos.remove(key)
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.utxos.values()
    }

    /// Outputs owned by an address, ordered by key for stable coin selection
    pub fn for_address(&self, address: &Address) -> Vec<Utxo> {
        let mut owned: Vec<Utxo> = self
            .utxos
            .values()
            .filter(|utxo| &utxo.address == address)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.key().cmp(&b.key()));
        owned
    }

    /// Sum of all outputs owned by an address
    pub fn balance(&self, address: &Address) -> f64 {
        self.utxos
            .values()
            .filter(|utxo| &utxo.address == address)
            .map(|utxo| utxo.amount)
            .sum()
    }
}

impl UtxoView for UtxoSet {
    fn utxo(&self, key: &UtxoKey) -> Option<&Utxo> {
        self.utxos.get(key)
    }
}
