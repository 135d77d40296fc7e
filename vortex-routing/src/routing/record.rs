//! Registry entries for live routing objects.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::routing::metrics::RoutingMetricsHandler;
use crate::routing::object::RoutingObject;

/// Prefix of the tag that records when a routing object was built.
pub const CREATED_TAG_PREFIX: &str = "created:";

/// Tag marking a record as a member of a load balancing group.
pub fn lb_group_tag(group: &str) -> String {
    format!("lbGroup={group}")
}

/// Tag naming the provider a record was generated by.
pub fn source_tag(provider: &str) -> String {
    format!("source={provider}")
}

/// Creation tag for the given instant, in ISO-8601 form.
pub fn created_tag(at: DateTime<Utc>) -> String {
    format!(
        "{CREATED_TAG_PREFIX}{}",
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

struct RecordInner {
    type_name: String,
    tags: BTreeSet<String>,
    created: String,
    config: serde_json::Value,
    routing_object: Arc<RoutingMetricsHandler>,
    stopped: AtomicBool,
}

/// A routing object together with its declared type, tags and build-time config.
///
/// Records are immutable. Updating a routing object means inserting a new record.
/// Clones share the underlying object, so [`stop`](Self::stop) runs at most once
/// across all of them.
#[derive(Clone)]
pub struct RoutingObjectRecord {
    inner: Arc<RecordInner>,
}

impl RoutingObjectRecord {
    /// Builds a record, stamping it with a fresh `created:` tag and wrapping the
    /// routing object in a [`RoutingMetricsHandler`].
    ///
    /// Any `created:` tag among `tags` is replaced.
    pub fn create<I, S>(
        type_name: impl Into<String>,
        tags: I,
        config: serde_json::Value,
        routing_object: Arc<dyn RoutingObject>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let created = created_tag(Utc::now());
        let mut tags: BTreeSet<String> = tags
            .into_iter()
            .map(Into::into)
            .filter(|tag| {
                let stale = tag.starts_with(CREATED_TAG_PREFIX);
                if stale {
                    debug!(tag = %tag, "dropping stale creation tag");
                }
                !stale
            })
            .collect();
        tags.insert(created.clone());

        Self {
            inner: Arc::new(RecordInner {
                type_name: type_name.into(),
                tags,
                created,
                config,
                routing_object: Arc::new(RoutingMetricsHandler::new(routing_object)),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// The declared routing object type, e.g. `BackendServiceProxy`.
    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    /// All tags, including the creation tag.
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.inner.tags
    }

    /// Whether the record carries the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.inner.tags.contains(tag)
    }

    /// The record's single `created:` tag.
    pub fn creation_time(&self) -> &str {
        &self.inner.created
    }

    /// Configuration the routing object was built from.
    pub fn config(&self) -> &serde_json::Value {
        &self.inner.config
    }

    /// The routing object, decorated with in-flight tracking.
    pub fn routing_object(&self) -> &Arc<RoutingMetricsHandler> {
        &self.inner.routing_object
    }

    /// Shuts the routing object down. Only the first call has an effect.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            debug!(type_name = %self.inner.type_name, "stopping routing object");
            self.inner.routing_object.stop();
        }
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl PartialEq for RoutingObjectRecord {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RoutingObjectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingObjectRecord")
            .field("type_name", &self.inner.type_name)
            .field("tags", &self.inner.tags)
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::object::{HttpHandler, HttpRequest, ResponseFuture};
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingStop {
        stops: AtomicUsize,
    }

    impl HttpHandler for CountingStop {
        fn handle(&self, _request: HttpRequest) -> ResponseFuture {
            Box::pin(async { Ok(http::Response::new(Bytes::new())) })
        }
    }

    impl RoutingObject for CountingStop {
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn created_tags(record: &RoutingObjectRecord) -> Vec<&String> {
        record
            .tags()
            .iter()
            .filter(|t| t.starts_with(CREATED_TAG_PREFIX))
            .collect()
    }

    #[test]
    fn create_adds_exactly_one_iso8601_creation_tag() {
        let record = RoutingObjectRecord::create(
            "HostProxy",
            [lb_group_tag("landing"), "state:active".to_string()],
            serde_json::Value::Null,
            Arc::new(CountingStop::default()),
        );

        let created = created_tags(&record);
        assert_eq!(created.len(), 1);
        let timestamp = created[0].trim_start_matches(CREATED_TAG_PREFIX);
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
        assert!(record.has_tag("lbGroup=landing"));
        assert!(record.has_tag("state:active"));
    }

    #[test]
    fn creation_time_is_stable() {
        let record = RoutingObjectRecord::create(
            "StaticResponseHandler",
            Vec::<String>::new(),
            serde_json::Value::Null,
            Arc::new(CountingStop::default()),
        );

        assert_eq!(record.creation_time(), record.creation_time());
        assert!(record.creation_time().starts_with(CREATED_TAG_PREFIX));
        assert_eq!(created_tags(&record), vec![record.creation_time()]);
    }

    #[test]
    fn recreating_replaces_previous_creation_tag() {
        let stale = created_tag(DateTime::<Utc>::from_timestamp(0, 0).unwrap());
        let record = RoutingObjectRecord::create(
            "HostProxy",
            [stale.clone(), source_tag("provider")],
            serde_json::Value::Null,
            Arc::new(CountingStop::default()),
        );

        assert!(!record.has_tag(&stale));
        assert_eq!(created_tags(&record).len(), 1);
        assert!(record.has_tag("source=provider"));
    }

    #[test]
    fn stop_runs_once_across_clones() {
        let object = Arc::new(CountingStop::default());
        let record = RoutingObjectRecord::create(
            "HostProxy",
            Vec::<String>::new(),
            serde_json::json!({ "host": "localhost:8080" }),
            object.clone(),
        );
        let copy = record.clone();

        record.stop();
        copy.stop();
        record.stop();

        assert_eq!(object.stops.load(Ordering::SeqCst), 1);
        assert!(copy.is_stopped());
    }
}
