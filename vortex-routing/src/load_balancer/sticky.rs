//! Sticky sessions: pin a client to the origin that served it first.

use std::sync::Arc;

use crate::load_balancer::{ActiveOrigins, LoadBalancer, OriginsSnapshot, Preferences, RemoteHost};

/// Name of the cookie pinning clients of `backend_id` to an origin.
pub fn sticky_session_cookie_name(backend_id: &str) -> String {
    format!("vortex_origin_{backend_id}")
}

/// `Set-Cookie` value pinning the client to `origin_id` for `max_age_seconds`.
pub fn sticky_session_cookie(backend_id: &str, origin_id: &str, max_age_seconds: u64) -> String {
    format!(
        "{}={origin_id}; Max-Age={max_age_seconds}; Path=/; HttpOnly",
        sticky_session_cookie_name(backend_id)
    )
}

/// Sends a request to its preferred origin while that origin is active, and
/// otherwise lets the wrapped strategy decide.
pub struct StickySessionStrategy {
    active: Arc<dyn ActiveOrigins>,
    delegate: Arc<dyn LoadBalancer>,
}

impl StickySessionStrategy {
    /// Wrap `delegate`, honouring preferences among `active`.
    pub fn new(active: Arc<dyn ActiveOrigins>, delegate: Arc<dyn LoadBalancer>) -> Self {
        Self { active, delegate }
    }

    fn preferred(&self, preferences: &Preferences) -> Option<RemoteHost> {
        let wanted = preferences.preferred_origins.as_deref()?;
        self.active
            .snapshot()
            .iter()
            .find(|h| h.id().as_str() == wanted && !preferences.avoids(h.id()))
            .cloned()
    }
}

impl LoadBalancer for StickySessionStrategy {
    fn choose(&self, preferences: &Preferences) -> Option<RemoteHost> {
        self.preferred(preferences)
            .or_else(|| self.delegate.choose(preferences))
    }

    fn origins_changed(&self, snapshot: &OriginsSnapshot) {
        self.delegate.origins_changed(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::origin::OriginId;
    use crate::load_balancer::testing::{active, host};
    use crate::load_balancer::RoundRobinStrategy;

    fn strategy(hosts: Vec<RemoteHost>) -> StickySessionStrategy {
        let set = active(hosts);
        StickySessionStrategy::new(set.clone(), Arc::new(RoundRobinStrategy::new(set)))
    }

    #[test]
    fn cookie_format() {
        assert_eq!(sticky_session_cookie_name("shop"), "vortex_origin_shop");
        assert_eq!(
            sticky_session_cookie("shop", "shop-02", 43_200),
            "vortex_origin_shop=shop-02; Max-Age=43200; Path=/; HttpOnly"
        );
    }

    #[test]
    fn preferred_active_origin_wins() {
        let sticky = strategy(vec![host("a", 0), host("b", 0), host("c", 0)]);
        let preferences = Preferences::preferring(Some("c".into()));

        for _ in 0..5 {
            assert_eq!(sticky.choose(&preferences).unwrap().id().as_str(), "c");
        }
    }

    #[test]
    fn unknown_preference_falls_back_to_delegate() {
        let sticky = strategy(vec![host("a", 0), host("b", 0)]);

        let chosen = sticky.choose(&Preferences::preferring(Some("gone".into()))).unwrap();
        assert_eq!(chosen.id().as_str(), "a");
    }

    #[test]
    fn tried_preference_is_not_chosen_again() {
        let sticky = strategy(vec![host("a", 0), host("b", 0)]);
        let preferences = Preferences::preferring(Some("a".into())).avoiding([OriginId::from("a")]);

        assert_eq!(sticky.choose(&preferences).unwrap().id().as_str(), "b");
    }
}
