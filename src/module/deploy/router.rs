//! Deterministic traffic splitting between active and candidate versions

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Active,
    Candidate,
}

#[derive(Debug, Clone, Copy)]
struct Split {
    fraction: f64,
    served: u64,
    to_candidate: u64,
}

/// Routes requests so that after `n` requests exactly
/// `floor(n * fraction)` went to the candidate
#[derive(Debug, Default)]
pub struct TrafficRouter {
    splits: Mutex<HashMap<String, Split>>,
}

impl TrafficRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `fraction` of `module`'s traffic to its candidate, restarting
    /// the count
    pub fn set_split(&self, module: &str, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.splits.lock().unwrap_or_else(PoisonError::into_inner).insert(
            module.to_string(),
            Split {
                fraction,
                served: 0,
                to_candidate: 0,
            },
        );
    }

    pub fn clear(&self, module: &str) {
        self.splits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(module);
    }

    pub fn fraction(&self, module: &str) -> Option<f64> {
        self.splits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .map(|s| s.fraction)
    }

    pub fn route(&self, module: &str) -> Route {
        let mut splits = self.splits.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(split) = splits.get_mut(module) else {
            return Route::Active;
        };
        split.served += 1;
        let due = (split.served as f64 * split.fraction).floor() as u64;
        if due > split.to_candidate {
            split.to_candidate += 1;
            Route::Candidate
        } else {
            Route::Active
        }
    }
}
