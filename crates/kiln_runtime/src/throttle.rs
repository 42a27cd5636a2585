//! Concurrency throttling.
//!
//! Rules cap how many actions with matching labels may run at once. A lease
//! holds one slot in every matching rule and gives them back on drop.

use crate::error::{ComputeError, ComputeResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A concurrency limit applied to actions whose labels match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRule {
    /// Labels an action must carry (all of them) for the rule to apply
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Count capacity separately for each value of this label
    #[serde(default)]
    pub count_per_label: Option<String>,
    /// Maximum concurrent leases
    pub capacity: u32,
}

impl ThrottleRule {
    /// Rule with a capacity and no labels (matches everything)
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            labels: BTreeMap::new(),
            count_per_label: None,
            capacity,
        }
    }

    /// Require a label
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Count per value of `label`
    #[must_use]
    pub fn per_label(mut self, label: impl Into<String>) -> Self {
        self.count_per_label = Some(label.into());
        self
    }

    /// Slot this rule would charge for `labels`, if it applies
    fn slot(&self, labels: &BTreeMap<String, String>) -> Option<String> {
        let matches = self
            .labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v));
        if !matches {
            return None;
        }

        match &self.count_per_label {
            Some(label) => labels.get(label).cloned(),
            None => Some(String::new()),
        }
    }
}

type Claim = (usize, String);

/// Shared throttle state
#[derive(Debug, Default)]
pub struct Throttle {
    rules: Vec<ThrottleRule>,
    counts: Mutex<HashMap<Claim, u32>>,
    released: Notify,
}

impl Throttle {
    /// Create a throttle enforcing `rules`
    #[must_use]
    pub fn new(rules: Vec<ThrottleRule>) -> Self {
        Self {
            rules,
            counts: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Configured rules
    #[must_use]
    pub fn rules(&self) -> &[ThrottleRule] {
        &self.rules
    }

    /// Leases currently held against `rule` for `slot`
    #[must_use]
    pub fn in_use(&self, rule: usize, slot: &str) -> u32 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(rule, slot.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Wait until every rule matching `labels` has room, then take a slot in each.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Cancelled`] if `cancel` fires first, or
    /// [`ComputeError::Throttle`] if a matching rule has zero capacity.
    pub async fn acquire(
        self: &Arc<Self>,
        labels: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> ComputeResult<Lease> {
        let mut claims = Vec::new();
        for (index, rule) in self.rules.iter().enumerate() {
            if let Some(slot) = rule.slot(labels) {
                if rule.capacity == 0 {
                    return Err(ComputeError::Throttle {
                        reason: format!("rule {} matches but has no capacity", index),
                    });
                }
                claims.push((index, slot));
            }
        }

        if claims.is_empty() {
            return Ok(Lease::unthrottled());
        }

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_claim(&claims) {
                return Ok(Lease {
                    throttle: Some(self.clone()),
                    claims,
                });
            }

            tracing::debug!(?labels, "waiting for throttle lease");
            tokio::select! {
                _ = &mut released => {}
                _ = cancel.cancelled() => return Err(ComputeError::Cancelled),
            }
        }
    }

    fn try_claim(&self, claims: &[Claim]) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);

        let has_room = claims.iter().all(|claim| {
            let used = counts.get(claim).copied().unwrap_or(0);
            used < self.rules[claim.0].capacity
        });
        if !has_room {
            return false;
        }

        for claim in claims {
            *counts.entry(claim.clone()).or_insert(0) += 1;
        }
        true
    }

    fn release(&self, claims: &[Claim]) {
        {
            let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
            for claim in claims {
                if let Some(count) = counts.get_mut(claim) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        counts.remove(claim);
                    }
                }
            }
        }
        self.released.notify_waiters();
    }
}

/// Held throttle slots, returned on drop
#[derive(Debug)]
pub struct Lease {
    throttle: Option<Arc<Throttle>>,
    claims: Vec<Claim>,
}

impl Lease {
    /// Lease that holds nothing
    #[must_use]
    pub fn unthrottled() -> Self {
        Self {
            throttle: None,
            claims: Vec::new(),
        }
    }

    /// Whether any rule applied
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        !self.claims.is_empty()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(throttle) = self.throttle.take() {
            throttle.release(&self.claims);
        }
    }
}
