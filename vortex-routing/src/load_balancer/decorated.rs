//! The closed set of load balancer compositions a dispatch chain can use.

use std::sync::Arc;

use tracing::info;

use crate::load_balancer::{
    ActiveOrigins, LoadBalancer, OriginRestrictionStrategy, OriginsSnapshot, Preferences,
    RemoteHost, StickySessionStrategy,
};

/// A base strategy, optionally wrapped by exactly one decorator.
pub enum DecoratedLoadBalancer {
    /// The base strategy on its own.
    Plain(Arc<dyn LoadBalancer>),
    /// The base strategy behind sticky sessions.
    StickySession(StickySessionStrategy),
    /// The base strategy behind cookie-driven origin restriction.
    OriginRestricted(OriginRestrictionStrategy),
}

impl DecoratedLoadBalancer {
    /// Wrap `base` for a backend service.
    ///
    /// Sticky sessions take precedence: a restriction cookie is ignored while
    /// sticky sessions are enabled.
    pub fn decorate(
        backend_id: &str,
        base: Arc<dyn LoadBalancer>,
        active: Arc<dyn ActiveOrigins>,
        sticky_sessions: bool,
        restriction_cookie: Option<&str>,
    ) -> Self {
        if sticky_sessions {
            info!(backend = %backend_id, "sticky sessions enabled");
            return Self::StickySession(StickySessionStrategy::new(active, base));
        }
        match restriction_cookie {
            Some(cookie) => {
                info!(backend = %backend_id, cookie = %cookie, "origin restriction enabled");
                Self::OriginRestricted(OriginRestrictionStrategy::new(active, base))
            }
            None => {
                info!(backend = %backend_id, "origin restriction disabled");
                Self::Plain(base)
            }
        }
    }

    /// Name of the composition, for logs and assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Plain(_) => "plain",
            Self::StickySession(_) => "sticky-session",
            Self::OriginRestricted(_) => "origin-restricted",
        }
    }

    /// Whether clients are pinned to origins.
    pub fn is_sticky(&self) -> bool {
        matches!(self, Self::StickySession(_))
    }
}

impl LoadBalancer for DecoratedLoadBalancer {
    fn choose(&self, preferences: &Preferences) -> Option<RemoteHost> {
        match self {
            Self::Plain(base) => base.choose(preferences),
            Self::StickySession(sticky) => sticky.choose(preferences),
            Self::OriginRestricted(restricted) => restricted.choose(preferences),
        }
    }

    fn origins_changed(&self, snapshot: &OriginsSnapshot) {
        match self {
            Self::Plain(base) => base.origins_changed(snapshot),
            Self::StickySession(sticky) => sticky.origins_changed(snapshot),
            Self::OriginRestricted(restricted) => restricted.origins_changed(snapshot),
        }
    }
}

impl std::fmt::Debug for DecoratedLoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DecoratedLoadBalancer").field(&self.kind()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::testing::{active, host};
    use crate::load_balancer::RoundRobinStrategy;

    fn decorate(sticky: bool, cookie: Option<&str>) -> DecoratedLoadBalancer {
        let set = active(vec![host("a", 0), host("b", 0)]);
        DecoratedLoadBalancer::decorate(
            "app",
            Arc::new(RoundRobinStrategy::new(set.clone())),
            set,
            sticky,
            cookie,
        )
    }

    #[test]
    fn sticky_sessions_take_precedence_over_restriction() {
        let lb = decorate(true, Some("originRestrict"));
        assert!(lb.is_sticky());
        assert_eq!(lb.kind(), "sticky-session");
    }

    #[test]
    fn restriction_cookie_alone_restricts() {
        assert_eq!(decorate(false, Some("originRestrict")).kind(), "origin-restricted");
    }

    #[test]
    fn no_flags_leaves_base_undecorated() {
        let lb = decorate(false, None);
        assert_eq!(lb.kind(), "plain");
        assert_eq!(lb.choose(&Preferences::default()).unwrap().id().as_str(), "a");
        assert_eq!(lb.choose(&Preferences::default()).unwrap().id().as_str(), "b");
    }
}
