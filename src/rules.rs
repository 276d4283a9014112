//! The accept/reject rule table gating sends.
//!
//! Rules live in one globally ordered list; evaluation walks it first to
//! last and the first matching rule decides. An empty table accepts
//! everything.

use alloc::vec::Vec;
use core::cmp;

use crate::error::{Error, Result};
use crate::wire::{Address, Rule};

pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    pub const fn new() -> RuleTable {
        RuleTable { rules: Vec::new() }
    }

    /// Inserts `rule` before the rule currently at the 1-based `position`;
    /// positions beyond the end append.
    pub fn add(&mut self, rule: Rule, position: u32) -> Result<()> {
        self.rules.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        let at = cmp::min(position.saturating_sub(1) as usize, self.rules.len());
        self.rules.insert(at, rule);
        Ok(())
    }

    /// Removes the rule at the 1-based `position`; out-of-range positions
    /// are a no-op.
    pub fn del_at(&mut self, position: u32) {
        let at = position.wrapping_sub(1) as usize;
        if at < self.rules.len() {
            self.rules.remove(at);
        }
    }

    /// Removes the first rule whose fields all equal `rule`'s.
    pub fn del_match(&mut self, rule: &Rule) {
        if let Some(at) = self.rules.iter().position(|r| r == rule) {
            self.rules.remove(at);
        }
    }

    pub fn flush(&mut self) {
        self.rules.clear();
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The rules from index `start` on; used by the list hypercall.
    pub fn tail(&self, start: usize) -> &[Rule] {
        self.rules.get(start..).unwrap_or(&[])
    }

    /// First-match walk; returns whether the send is accepted.
    pub fn check(&self, src: Address, dst: Address) -> bool {
        for rule in &self.rules {
            if rule.matches(src, dst) {
                return rule.accept;
            }
        }
        true
    }
}
