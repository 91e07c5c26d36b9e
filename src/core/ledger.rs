//! Five-dimension resource admission control.
//!
//! Totals are committed in fixed-point milli-units so that an allocation
//! followed by its release restores the ledger exactly.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::serde::{ResourceCapacity, ResourceRequirement, TaskId};

const SCALE: f64 = 1000.0;
const DIMENSIONS: usize = 5;

type Units = [u64; DIMENSIONS];

/// Per-dimension utilization in percent of capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    /// CPU utilization.
    pub cpu: f64,
    /// Memory utilization.
    pub memory: f64,
    /// Disk utilization.
    pub disk: f64,
    /// Network utilization.
    pub network: f64,
    /// GPU utilization.
    pub gpu: f64,
}

impl ResourceUtilization {
    const fn from_array(values: [f64; DIMENSIONS]) -> Self {
        Self {
            cpu: values[0],
            memory: values[1],
            disk: values[2],
            network: values[3],
            gpu: values[4],
        }
    }
}

#[derive(Default)]
struct LedgerState {
    committed: Units,
    allocations: HashMap<TaskId, (ResourceRequirement, Units)>,
}

/// Tracks committed resources against a fixed budget.
///
/// All mutation goes through one mutex; no method ever fails loudly, callers
/// re-queue when `allocate` returns false.
pub struct ResourceLedger {
    capacity: ResourceCapacity,
    capacity_units: Units,
    state: Mutex<LedgerState>,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_units(values: [f64; DIMENSIONS]) -> Units {
    values.map(|v| {
        if v.is_finite() && v > 0.0 {
            (v * SCALE).round() as u64
        } else {
            0
        }
    })
}

impl ResourceLedger {
    /// Create a ledger with the given budget.
    #[must_use]
    pub fn new(capacity: ResourceCapacity) -> Self {
        Self {
            capacity,
            capacity_units: to_units(capacity.as_array()),
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// The configured budget.
    #[must_use]
    pub const fn capacity(&self) -> ResourceCapacity {
        self.capacity
    }

    fn fits(&self, committed: &Units, needed: &Units) -> bool {
        committed
            .iter()
            .zip(needed)
            .zip(&self.capacity_units)
            .all(|((c, n), cap)| c.saturating_add(*n) <= *cap)
    }

    /// Whether `req` fits the currently uncommitted budget.
    #[must_use]
    pub fn can_allocate(&self, req: &ResourceRequirement) -> bool {
        let needed = to_units(req.as_array());
        let state = self.state.lock();
        self.fits(&state.committed, &needed)
    }

    /// Whether `req` could ever be admitted, even by an idle ledger.
    #[must_use]
    pub fn fits_capacity(&self, req: &ResourceRequirement) -> bool {
        self.fits(&[0; DIMENSIONS], &to_units(req.as_array()))
    }

    /// Re-check and commit `req` for `id`.
    ///
    /// Returns false without side effects when the budget is insufficient or
    /// `id` already holds an allocation.
    pub fn allocate(&self, id: TaskId, req: &ResourceRequirement) -> bool {
        let needed = to_units(req.as_array());
        let mut state = self.state.lock();
        if state.allocations.contains_key(&id) {
            tracing::warn!(task_id = %id, "allocation requested twice for the same id");
            return false;
        }
        if !self.fits(&state.committed, &needed) {
            return false;
        }
        for (c, n) in state.committed.iter_mut().zip(&needed) {
            *c += n;
        }
        state.allocations.insert(id, (*req, needed));
        tracing::debug!(task_id = %id, requirement = ?req, "resources allocated");
        true
    }

    /// Release whatever `id` holds. Returns false if it held nothing.
    pub fn release(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        let Some((_, units)) = state.allocations.remove(&id) else {
            return false;
        };
        for (c, n) in state.committed.iter_mut().zip(&units) {
            *c = c.saturating_sub(*n);
        }
        tracing::debug!(task_id = %id, "resources released");
        true
    }

    /// Requirement currently held by `id`, if any.
    #[must_use]
    pub fn allocated(&self, id: TaskId) -> Option<ResourceRequirement> {
        self.state.lock().allocations.get(&id).map(|(req, _)| *req)
    }

    /// Number of ids currently holding resources.
    #[must_use]
    pub fn active_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Per-dimension utilization. Zero-capacity dimensions report 100 %.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> ResourceUtilization {
        let committed = self.state.lock().committed;
        let mut values = [0.0; DIMENSIONS];
        for (i, value) in values.iter_mut().enumerate() {
            let cap = self.capacity_units[i];
            *value = if cap == 0 {
                100.0
            } else {
                committed[i] as f64 / cap as f64 * 100.0
            };
        }
        ResourceUtilization::from_array(values)
    }
}
