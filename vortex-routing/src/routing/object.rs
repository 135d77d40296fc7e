//! The request-handling contract every routing object implements.

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::Result;

/// A fully buffered HTTP request travelling through the proxy.
pub type HttpRequest = http::Request<Bytes>;

/// A fully buffered HTTP response travelling back to the client.
pub type HttpResponse = http::Response<Bytes>;

/// The eventual outcome of handling a request.
///
/// Dropping the future before it resolves cancels the request.
pub type ResponseFuture = BoxFuture<'static, Result<HttpResponse>>;

/// Anything that turns a request into an eventual response.
pub trait HttpHandler: Send + Sync {
    /// Handle a request. Must not block the calling thread.
    fn handle(&self, request: HttpRequest) -> ResponseFuture;
}

/// A live, request-handling unit built from a configuration record.
pub trait RoutingObject: HttpHandler {
    /// Release resources held by the object. Requests already admitted keep running.
    fn stop(&self) {}
}

/// Copies a buffered request so it can be sent more than once.
pub fn clone_request(request: &HttpRequest) -> HttpRequest {
    let mut copy = http::Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

/// Value of the named cookie in the request's `Cookie` headers.
pub fn request_cookie(request: &HttpRequest, name: &str) -> Option<String> {
    request
        .headers()
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
}
