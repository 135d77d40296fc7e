//! Origin restriction: let a client narrow the candidate origins with a cookie.

use std::sync::Arc;

use rand::seq::SliceRandom;
use regex::Regex;
use tracing::error;

use crate::load_balancer::{ActiveOrigins, LoadBalancer, OriginsSnapshot, Preferences, RemoteHost};

/// Restricts the candidate origins to those whose id matches one of the
/// comma-separated patterns in the restriction cookie, and picks one at random.
///
/// Without a cookie the wrapped strategy decides. A cookie that matches no active
/// origin yields no origin. A cookie with an invalid pattern is logged and ignored,
/// picking among all active origins.
pub struct OriginRestrictionStrategy {
    active: Arc<dyn ActiveOrigins>,
    delegate: Arc<dyn LoadBalancer>,
}

impl OriginRestrictionStrategy {
    /// Wrap `delegate`, restricting among `active`.
    pub fn new(active: Arc<dyn ActiveOrigins>, delegate: Arc<dyn LoadBalancer>) -> Self {
        Self { active, delegate }
    }

    fn restricted(&self, cookie: &str, preferences: &Preferences) -> Option<RemoteHost> {
        let hosts = self.active.snapshot();
        let candidates = preferences.candidates(&hosts);

        let allowed: Vec<&RemoteHost> = match compile(cookie) {
            Ok(patterns) => candidates
                .into_iter()
                .filter(|h| patterns.iter().any(|p| p.is_match(h.id().as_str())))
                .collect(),
            Err(e) => {
                error!(cookie = %cookie, error = %e, "invalid origin restriction cookie");
                candidates
            }
        };

        allowed.choose(&mut rand::thread_rng()).map(|h| (*h).clone())
    }
}

fn compile(cookie: &str) -> Result<Vec<Regex>, regex::Error> {
    cookie
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| Regex::new(&format!("^(?:{p})$")))
        .collect()
}

impl LoadBalancer for OriginRestrictionStrategy {
    fn choose(&self, preferences: &Preferences) -> Option<RemoteHost> {
        match preferences.preferred_origins.as_deref() {
            Some(cookie) => self.restricted(cookie, preferences),
            None => self.delegate.choose(preferences),
        }
    }

    fn origins_changed(&self, snapshot: &OriginsSnapshot) {
        self.delegate.origins_changed(snapshot);
    }
}
