//! Subscription Tracking
//!
//! The authoritative set of symbols a client wants pushed. The set is
//! mutated regardless of connection state and replayed in full on every
//! successful (re)connect.
//!
//! # Design
//!
//! `add` and `remove` report only the symbols whose membership actually
//! changed, so callers send control frames for real deltas and repeated
//! calls are free.

use std::collections::BTreeSet;

/// A ticker symbol.
pub type Symbol = String;

/// Canonical form of a symbol: trimmed and upper-cased.
#[must_use]
pub fn normalize_symbol(symbol: &str) -> Symbol {
    symbol.trim().to_uppercase()
}

/// Ordered set of subscribed symbols.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    symbols: BTreeSet<Symbol>,
}

impl SubscriptionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add symbols.
    ///
    /// Returns symbols that were not already present (need an upstream
    /// subscribe). Blank entries are ignored.
    pub fn add<I, S>(&mut self, symbols: I) -> Vec<Symbol>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = Vec::new();

        for symbol in symbols {
            let symbol = normalize_symbol(symbol.as_ref());
            if symbol.is_empty() {
                continue;
            }
            if self.symbols.insert(symbol.clone()) {
                added.push(symbol);
            }
        }

        added
    }

    /// Remove symbols.
    ///
    /// Returns symbols that were present (need an upstream unsubscribe).
    pub fn remove<I, S>(&mut self, symbols: I) -> Vec<Symbol>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = Vec::new();

        for symbol in symbols {
            let symbol = normalize_symbol(symbol.as_ref());
            if self.symbols.remove(&symbol) {
                removed.push(symbol);
            }
        }

        removed
    }

    /// Whether `symbol` is subscribed.
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(&normalize_symbol(symbol))
    }

    /// All symbols in sorted order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Symbol> {
        self.symbols.iter().cloned().collect()
    }

    /// Number of subscribed symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
