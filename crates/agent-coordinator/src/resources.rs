//! Resource capacity bookkeeping
//!
//! The ledger is only touched through the coordinator's registry lock, which
//! is what keeps `allocated <= capacity` for every resource type.

use crate::error::{CoordinatorError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

// Totals at or below this after a release are float residue, not holdings.
const RELEASE_EPSILON: f64 = 1e-9;

/// Quantity of one resource type held by an agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceAllocation {
    pub resource_type: String,
    pub amount: f64,
    pub allocated_at: DateTime<Utc>,
}

/// Capacity and current allocation of one resource type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub resource_type: String,
    pub capacity: f64,
    pub allocated: f64,
    /// `allocated / capacity`, 0 when the capacity is 0
    pub utilization: f64,
}

/// Tracks allocated amounts against fixed capacities
///
/// Resource types without a configured capacity have capacity 0.
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    capacity: HashMap<String, f64>,
    allocated: HashMap<String, f64>,
}

impl ResourceLedger {
    pub fn new(capacity: HashMap<String, f64>) -> Self {
        Self {
            capacity,
            allocated: HashMap::new(),
        }
    }

    pub fn capacity(&self, resource_type: &str) -> f64 {
        self.capacity.get(resource_type).copied().unwrap_or(0.0)
    }

    pub fn allocated(&self, resource_type: &str) -> f64 {
        self.allocated.get(resource_type).copied().unwrap_or(0.0)
    }

    pub fn available(&self, resource_type: &str) -> f64 {
        (self.capacity(resource_type) - self.allocated(resource_type)).max(0.0)
    }

    /// Fail with `InsufficientResources` on the first type that would overflow
    pub fn check(&self, requirements: &BTreeMap<String, f64>) -> Result<()> {
        for (resource_type, &requested) in requirements {
            if requested <= 0.0 {
                continue;
            }
            let capacity = self.capacity(resource_type);
            if self.allocated(resource_type) + requested > capacity {
                return Err(CoordinatorError::InsufficientResources {
                    resource_type: resource_type.clone(),
                    requested,
                    available: self.available(resource_type),
                    capacity,
                });
            }
        }
        Ok(())
    }

    /// Check and then record every non-zero requirement
    ///
    /// Either all requirements are allocated or none is.
    pub fn allocate(
        &mut self,
        requirements: &BTreeMap<String, f64>,
    ) -> Result<BTreeMap<String, ResourceAllocation>> {
        self.check(requirements)?;

        let now = Utc::now();
        let mut allocations = BTreeMap::new();
        for (resource_type, &amount) in requirements {
            if amount <= 0.0 {
                continue;
            }
            *self.allocated.entry(resource_type.clone()).or_insert(0.0) += amount;
            allocations.insert(
                resource_type.clone(),
                ResourceAllocation {
                    resource_type: resource_type.clone(),
                    amount,
                    allocated_at: now,
                },
            );
        }
        Ok(allocations)
    }

    /// Return allocations to the pool
    pub fn release(&mut self, allocations: &BTreeMap<String, ResourceAllocation>) {
        for allocation in allocations.values() {
            if let Some(total) = self.allocated.get_mut(&allocation.resource_type) {
                *total -= allocation.amount;
                if *total <= RELEASE_EPSILON {
                    self.allocated.remove(&allocation.resource_type);
                }
            }
        }
    }

    /// Usage of every configured or allocated type, sorted by name
    pub fn usage(&self) -> Vec<ResourceUsage> {
        let mut types: Vec<&String> = self.capacity.keys().chain(self.allocated.keys()).collect();
        types.sort();
        types.dedup();

        types
            .into_iter()
            .map(|resource_type| {
                let capacity = self.capacity(resource_type);
                let allocated = self.allocated(resource_type);
                ResourceUsage {
                    resource_type: resource_type.clone(),
                    capacity,
                    allocated,
                    utilization: if capacity > 0.0 { allocated / capacity } else { 0.0 },
                }
            })
            .collect()
    }
}
