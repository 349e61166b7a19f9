//! Role-aware principal ID generator
//!
//! IDs come from a per-role counter in the coordination store, seeded on first
//! use and advanced by a random step. When the store is unreachable a
//! timestamp-derived id is issued instead; those live in a numeric range far
//! above every counter value.

use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::coord::CoordinationStore;
use crate::core_types::Role;
use crate::error::{LedgerError, LedgerResult};

/// Seed and inclusive random step range for one role's counter
#[derive(Debug, Clone, Copy)]
pub struct RoleSequence {
    pub seed: i64,
    pub step_min: i64,
    pub step_max: i64,
}

pub fn sequence_for(role: Role) -> RoleSequence {
    match role {
        Role::ShopOwner => RoleSequence {
            seed: 19_906_070_668,
            step_min: 100,
            step_max: 500,
        },
        Role::Operator => RoleSequence {
            seed: 58_608_109_796,
            step_min: 30,
            step_max: 50,
        },
        Role::Platform => RoleSequence {
            seed: 91_609_051_906,
            step_min: 10,
            step_max: 20,
        },
    }
}

fn counter_key(role: Role) -> String {
    format!("idgen:{}", role.as_str())
}

/// `8 + unix_ms * 1000 + uniform[0, 999]`
pub fn fallback_id(unix_ms: i64, jitter: i64) -> i64 {
    8 + unix_ms * 1000 + jitter
}

pub struct IdGenerator {
    coord: Arc<dyn CoordinationStore>,
    /// Highest counter-issued id seen by this process
    max_counter: AtomicI64,
    last_fallback: AtomicI64,
}

impl IdGenerator {
    pub fn new(coord: Arc<dyn CoordinationStore>) -> Self {
        Self {
            coord,
            max_counter: AtomicI64::new(0),
            last_fallback: AtomicI64::new(0),
        }
    }

    pub async fn next(&self, role: Role) -> LedgerResult<i64> {
        let seq = sequence_for(role);
        let step = rand::thread_rng().gen_range(seq.step_min..=seq.step_max);

        match self.coord.incr_counter(&counter_key(role), seq.seed, step).await {
            Ok(id) => {
                self.max_counter.fetch_max(id, Ordering::SeqCst);
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(role = %role, error = %e, "ID counter unavailable, using timestamp fallback");
                self.fallback()
            }
        }
    }

    fn fallback(&self) -> LedgerResult<i64> {
        let unix_ms = chrono::Utc::now().timestamp_millis();
        let jitter = rand::thread_rng().gen_range(0..=999);
        let id = fallback_id(unix_ms, jitter);

        let previous = self.last_fallback.swap(id, Ordering::SeqCst);
        if id == previous || id <= self.max_counter.load(Ordering::SeqCst) {
            return Err(LedgerError::Integrity(format!(
                "fallback id {} collides with a previously issued id",
                id
            )));
        }
        Ok(id)
    }
}
