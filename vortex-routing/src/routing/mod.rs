//! Routing objects, their registry records, and request-lifetime metrics.

pub mod metrics;
pub mod object;
pub mod record;

pub use metrics::{RoutingMetric, RoutingMetricsHandler};
pub use object::{HttpHandler, HttpRequest, HttpResponse, ResponseFuture, RoutingObject};
pub use record::RoutingObjectRecord;
