//! Credit ledger
//!
//! Flow-control credit is a bounded counter: one unit is acquired for every
//! at-least-once delivery handed to the application and returned when that
//! delivery is confirmed. Outstanding deliveries are tracked by tag in a
//! map, so releasing the same tag twice returns credit only once.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The tag was not outstanding (already confirmed, abandoned, or never
    /// issued).
    NotPending,
    Released { credit_returned: bool },
}

#[derive(Debug, Clone)]
pub struct CreditLedger {
    limit: Option<u32>,
    remaining: u32,
    pending: HashMap<u64, bool>,
}

impl CreditLedger {
    /// `None` means unlimited credit.
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            remaining: limit.unwrap_or(u32::MAX),
            pending: HashMap::new(),
        }
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Credit left before delivery must wait; `None` when unlimited.
    pub fn remaining(&self) -> Option<u32> {
        self.limit.map(|_| self.remaining)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, tag: u64) -> bool {
        self.pending.contains_key(&tag)
    }

    /// Takes one unit of credit for `tag`. Returns false, leaving the ledger
    /// untouched, when no credit is left.
    pub fn try_acquire(&mut self, tag: u64) -> bool {
        if self.limit.is_some() {
            if self.remaining == 0 {
                return false;
            }
            self.remaining -= 1;
        }
        self.pending.insert(tag, true);
        true
    }

    /// Tracks `tag` for acknowledgement without consuming credit.
    pub fn track(&mut self, tag: u64) {
        self.pending.entry(tag).or_insert(false);
    }

    pub fn release(&mut self, tag: u64) -> Release {
        match self.pending.remove(&tag) {
            None => Release::NotPending,
            Some(consumed) => {
                if consumed && self.limit.is_some() {
                    self.remaining = self.remaining.saturating_add(1);
                }
                Release::Released {
                    credit_returned: consumed,
                }
            }
        }
    }

    /// Forgets every outstanding delivery and restores the full credit.
    /// Returns how many deliveries were abandoned.
    pub fn abandon_all(&mut self) -> usize {
        let abandoned = self.pending.len();
        self.pending.clear();
        self.remaining = self.limit.unwrap_or(u32::MAX);
        abandoned
    }
}
