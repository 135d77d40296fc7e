//! Power-of-two-choices origin selection.

use std::sync::Arc;

use rand::seq::index::sample;

use crate::load_balancer::{ActiveOrigins, LoadBalancer, Preferences, RemoteHost};

/// Samples two origins at random and keeps the less busy one.
pub struct PowerOfTwoStrategy {
    active: Arc<dyn ActiveOrigins>,
}

impl PowerOfTwoStrategy {
    /// Balance over `active`.
    pub fn new(active: Arc<dyn ActiveOrigins>) -> Self {
        Self { active }
    }
}

impl LoadBalancer for PowerOfTwoStrategy {
    fn choose(&self, preferences: &Preferences) -> Option<RemoteHost> {
        let hosts = self.active.snapshot();
        let candidates = preferences.candidates(&hosts);

        match candidates.len() {
            0 => None,
            1 => Some(candidates[0].clone()),
            len => {
                let picked = sample(&mut rand::thread_rng(), len, 2);
                let first = candidates[picked.index(0)];
                let second = candidates[picked.index(1)];
                let winner = if second.metric().ongoing_activities() < first.metric().ongoing_activities() {
                    second
                } else {
                    first
                };
                Some(winner.clone())
            }
        }
    }
}
