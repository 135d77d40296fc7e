//! Least-busy origin selection.

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::load_balancer::{ActiveOrigins, LoadBalancer, Preferences, RemoteHost};

/// Picks the origin with the fewest busy connections, breaking ties at random.
///
/// This is the strategy a backend service gets when it names none.
pub struct BusyConnectionsStrategy {
    active: Arc<dyn ActiveOrigins>,
}

impl BusyConnectionsStrategy {
    /// Balance over `active`.
    pub fn new(active: Arc<dyn ActiveOrigins>) -> Self {
        Self { active }
    }
}

impl LoadBalancer for BusyConnectionsStrategy {
    fn choose(&self, preferences: &Preferences) -> Option<RemoteHost> {
        let hosts = self.active.snapshot();
        let candidates = preferences.candidates(&hosts);

        let least = candidates
            .iter()
            .map(|h| h.metric().ongoing_activities())
            .min()?;
        let idlest: Vec<&RemoteHost> = candidates
            .into_iter()
            .filter(|h| h.metric().ongoing_activities() == least)
            .collect();

        idlest.choose(&mut rand::thread_rng()).map(|h| (*h).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::origin::OriginId;
    use crate::load_balancer::testing::{active, host};
    use std::collections::HashSet;

    #[test]
    fn picks_least_busy_origin() {
        let strategy = BusyConnectionsStrategy::new(active(vec![
            host("a", 4),
            host("b", 1),
            host("c", 9),
        ]));

        for _ in 0..20 {
            let chosen = strategy.choose(&Preferences::default()).unwrap();
            assert_eq!(chosen.id().as_str(), "b");
        }
    }

    #[test]
    fn ties_are_spread_across_origins() {
        let strategy = BusyConnectionsStrategy::new(active(vec![
            host("a", 2),
            host("b", 2),
            host("c", 5),
        ]));

        let chosen: HashSet<String> = (0..200)
            .filter_map(|_| strategy.choose(&Preferences::default()))
            .map(|h| h.id().to_string())
            .collect();
        assert_eq!(chosen, HashSet::from(["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn skips_origins_already_tried() {
        let strategy = BusyConnectionsStrategy::new(active(vec![host("a", 0), host("b", 3)]));

        let chosen = strategy
            .choose(&Preferences::default().avoiding([OriginId::from("a")]))
            .unwrap();
        assert_eq!(chosen.id().as_str(), "b");
    }

    #[test]
    fn nothing_to_choose_from_empty_set() {
        let strategy = BusyConnectionsStrategy::new(active(Vec::new()));
        assert!(strategy.choose(&Preferences::default()).is_none());
    }
}
