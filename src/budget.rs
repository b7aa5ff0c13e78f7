//! Live counters for every bounded resource.
//!
//! Each [`Budget`] is a ceiling plus an atomic usage counter. Reservations
//! use a compare-and-swap loop, so `usage <= ceiling` holds at every instant
//! without a lock, and a multi-resource reservation is all-or-nothing: on the
//! first refusal everything taken so far is handed back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::cache::page::Tier;
use crate::config::Config;
use crate::scheduler::tenant::TenantId;

/// A bounded resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    /// Prompt plus generation tokens of running sequences.
    TokensInFlight,
    PrefillSlots,
    DecodeSlots,
    /// Bytes in one cache tier.
    TierCapacity(Tier),
    /// Projected KV bytes moved per transfer window.
    TransferBandwidth,
    /// Running sequences of one tenant.
    TenantConcurrency(TenantId),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::TokensInFlight => f.write_str("tokens_in_flight"),
            Resource::PrefillSlots => f.write_str("prefill_slots"),
            Resource::DecodeSlots => f.write_str("decode_slots"),
            Resource::TierCapacity(tier) => write!(f, "tier_capacity:{tier}"),
            Resource::TransferBandwidth => f.write_str("transfer_bandwidth"),
            Resource::TenantConcurrency(tenant) => write!(f, "tenant_concurrency:{tenant}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BudgetError {
    #[error("{resource} exhausted: requested {requested}, available {available}")]
    Exhausted {
        resource: Resource,
        requested: u64,
        available: u64,
    },

    #[error("{resource} underflow: releasing {amount} with only {usage} in use")]
    Underflow {
        resource: Resource,
        amount: u64,
        usage: u64,
    },

    #[error("no budget registered for {0}")]
    Unknown(Resource),
}

/// One resource's ceiling and usage.
#[derive(Debug)]
pub struct Budget {
    resource: Resource,
    ceiling: u64,
    usage: AtomicU64,
}

impl Budget {
    pub fn new(resource: Resource, ceiling: u64) -> Self {
        Self {
            resource,
            ceiling,
            usage: AtomicU64::new(0),
        }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    pub fn headroom(&self) -> u64 {
        self.ceiling.saturating_sub(self.usage())
    }

    pub fn utilization(&self) -> f64 {
        if self.ceiling == 0 {
            return 0.0;
        }
        self.usage() as f64 / self.ceiling as f64
    }

    /// Take `amount` if it fits under the ceiling.
    pub fn try_reserve(&self, amount: u64) -> Result<(), BudgetError> {
        let mut current = self.usage.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(amount)
                .filter(|next| *next <= self.ceiling)
                .ok_or_else(|| BudgetError::Exhausted {
                    resource: self.resource.clone(),
                    requested: amount,
                    available: self.ceiling.saturating_sub(current),
                })?;
            match self.usage.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Give back `amount`. Releasing more than is held is refused and leaves usage untouched.
    pub fn release(&self, amount: u64) -> Result<(), BudgetError> {
        let mut current = self.usage.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_sub(amount)
                .ok_or_else(|| BudgetError::Underflow {
                    resource: self.resource.clone(),
                    amount,
                    usage: current,
                })?;
            match self.usage.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Amounts held against a set of budgets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservation {
    resources: Vec<(Resource, u64)>,
}

impl Reservation {
    pub fn is_empty(&self) -> bool {
        self.resources.iter().all(|(_, amount)| *amount == 0)
    }

    pub fn amount(&self, resource: &Resource) -> u64 {
        self.resources
            .iter()
            .filter(|(r, _)| r == resource)
            .map(|(_, amount)| *amount)
            .sum()
    }

    pub fn items(&self) -> &[(Resource, u64)] {
        &self.resources
    }

    /// Detach up to `amount` of `resource` from this reservation.
    ///
    /// The budget's usage is unchanged; the caller now owns what was taken.
    pub fn take(&mut self, resource: &Resource, amount: u64) -> u64 {
        let mut taken = 0;
        for (r, held) in self.resources.iter_mut() {
            if r == resource && taken < amount {
                let n = (*held).min(amount - taken);
                *held -= n;
                taken += n;
            }
        }
        taken
    }

    /// Held amounts keyed by resource name.
    pub fn summary(&self) -> Vec<(String, u64)> {
        self.resources
            .iter()
            .filter(|(_, amount)| *amount > 0)
            .map(|(r, amount)| (r.to_string(), *amount))
            .collect()
    }

    fn push(&mut self, resource: Resource, amount: u64) {
        self.resources.push((resource, amount));
    }
}

/// Serializable view of one budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub resource: String,
    pub ceiling: u64,
    pub usage: u64,
    pub utilization: f64,
}

/// All budgets, keyed by resource.
#[derive(Debug, Default)]
pub struct BudgetTracker {
    budgets: DashMap<Resource, Arc<Budget>>,
}

impl BudgetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every budget the configuration declares.
    pub fn from_config(config: &Config) -> Self {
        let tracker = Self::new();
        let b = &config.budgets;
        tracker.register(Resource::TokensInFlight, b.max_tokens_in_flight);
        tracker.register(Resource::PrefillSlots, b.max_prefill_concurrency);
        tracker.register(Resource::DecodeSlots, b.max_decode_concurrency);
        let window = b.transfer_window().as_secs_f64();
        tracker.register(
            Resource::TransferBandwidth,
            (b.max_transfer_bytes_per_sec as f64 * window) as u64,
        );
        for tier in config.tiers.enabled_tiers() {
            tracker.register(
                Resource::TierCapacity(tier),
                config.tiers.budget_for(tier),
            );
        }
        for tenant in &config.tenants {
            tracker.register(
                Resource::TenantConcurrency(TenantId::from(tenant.id.as_str())),
                tenant.max_concurrency,
            );
        }
        tracker
    }

    /// Add or replace a budget. Replacing resets usage.
    pub fn register(&self, resource: Resource, ceiling: u64) {
        self.budgets
            .insert(resource.clone(), Arc::new(Budget::new(resource, ceiling)));
    }

    pub fn get(&self, resource: &Resource) -> Option<Arc<Budget>> {
        self.budgets.get(resource).map(|entry| entry.value().clone())
    }

    fn budget(&self, resource: &Resource) -> Result<Arc<Budget>, BudgetError> {
        self.get(resource)
            .ok_or_else(|| BudgetError::Unknown(resource.clone()))
    }

    pub fn try_reserve(&self, resource: &Resource, amount: u64) -> Result<(), BudgetError> {
        self.budget(resource)?.try_reserve(amount)
    }

    pub fn release(&self, resource: &Resource, amount: u64) -> Result<(), BudgetError> {
        self.budget(resource)?.release(amount)
    }

    /// Reserve every `(resource, amount)` or nothing.
    pub fn try_reserve_all(
        &self,
        requests: &[(Resource, u64)],
    ) -> Result<Reservation, BudgetError> {
        let mut reservation = Reservation::default();
        for (resource, amount) in requests {
            if *amount == 0 {
                continue;
            }
            let outcome = self
                .budget(resource)
                .and_then(|budget| budget.try_reserve(*amount));
            if let Err(e) = outcome {
                // Rolling back amounts we just took cannot underflow.
                let _ = self.release_all(&reservation);
                return Err(e);
            }
            reservation.push(resource.clone(), *amount);
        }
        Ok(reservation)
    }

    /// Return everything a reservation holds. Every item is attempted; the
    /// first failure is reported.
    pub fn release_all(&self, reservation: &Reservation) -> Result<(), BudgetError> {
        let mut first_err = None;
        for (resource, amount) in reservation.items() {
            if *amount == 0 {
                continue;
            }
            if let Err(e) = self.release(resource, *amount) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn usage(&self, resource: &Resource) -> u64 {
        self.get(resource).map(|b| b.usage()).unwrap_or(0)
    }

    pub fn headroom(&self, resource: &Resource) -> u64 {
        self.get(resource).map(|b| b.headroom()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<BudgetSnapshot> {
        let mut snapshot: Vec<BudgetSnapshot> = self
            .budgets
            .iter()
            .map(|entry| {
                let budget = entry.value();
                BudgetSnapshot {
                    resource: budget.resource().to_string(),
                    ceiling: budget.ceiling(),
                    usage: budget.usage(),
                    utilization: budget.utilization(),
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.resource.cmp(&b.resource));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_respects_ceiling() {
        let budget = Budget::new(Resource::TokensInFlight, 100);
        budget.try_reserve(60).unwrap();
        budget.try_reserve(40).unwrap();
        let err = budget.try_reserve(1).unwrap_err();
        assert_eq!(
            err,
            BudgetError::Exhausted {
                resource: Resource::TokensInFlight,
                requested: 1,
                available: 0
            }
        );
        assert_eq!(budget.usage(), 100);
    }

    #[test]
    fn test_release_underflow_refused() {
        let budget = Budget::new(Resource::PrefillSlots, 4);
        budget.try_reserve(1).unwrap();
        assert!(matches!(
            budget.release(2),
            Err(BudgetError::Underflow { .. })
        ));
        assert_eq!(budget.usage(), 1);
        budget.release(1).unwrap();
        assert_eq!(budget.usage(), 0);
    }

    #[test]
    fn test_reserve_all_rolls_back() {
        let tracker = BudgetTracker::new();
        tracker.register(Resource::TokensInFlight, 1000);
        tracker.register(Resource::PrefillSlots, 1);
        tracker.try_reserve(&Resource::PrefillSlots, 1).unwrap();

        let err = tracker
            .try_reserve_all(&[
                (Resource::TokensInFlight, 500),
                (Resource::PrefillSlots, 1),
            ])
            .unwrap_err();
        assert!(matches!(err, BudgetError::Exhausted { .. }));
        assert_eq!(tracker.usage(&Resource::TokensInFlight), 0);
    }

    #[test]
    fn test_reservation_take_detaches() {
        let tracker = BudgetTracker::new();
        let device = Resource::TierCapacity(Tier::DeviceMemory);
        tracker.register(device.clone(), 1000);
        let mut r = tracker.try_reserve_all(&[(device.clone(), 300)]).unwrap();

        assert_eq!(r.take(&device, 200), 200);
        assert_eq!(r.amount(&device), 100);
        assert_eq!(r.take(&device, 200), 100);
        assert!(r.is_empty());
        // Usage is still held by whoever took it.
        assert_eq!(tracker.usage(&device), 300);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_ceiling() {
        let budget = Arc::new(Budget::new(Resource::DecodeSlots, 50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = budget.clone();
                std::thread::spawn(move || {
                    let mut won = 0;
                    for _ in 0..100 {
                        if budget.try_reserve(1).is_ok() {
                            won += 1;
                        }
                        assert!(budget.usage() <= budget.ceiling());
                    }
                    won
                })
            })
            .collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(budget.usage(), 50);
    }

    #[test]
    fn test_from_config_registers_tenants_and_tiers() {
        let mut config = Config::default();
        config.fill_defaults();
        let tracker = BudgetTracker::from_config(&config);
        assert!(tracker
            .get(&Resource::TenantConcurrency(TenantId::from("default")))
            .is_some());
        assert!(tracker
            .get(&Resource::TierCapacity(Tier::DeviceMemory))
            .is_some());
        assert!(tracker
            .get(&Resource::TierCapacity(Tier::RemoteObject))
            .is_none());
    }
}
