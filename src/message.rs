use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio_util::sync::CancellationToken;

use crate::body::Body;

/// HTTP request submitted to the collapse proxy or an upstream client.
///
/// A request may carry a cancellation token. The token bounds only the
/// caller's own wait for the collapsed response; the upstream fetch is bound
/// to the proxy's lifetime because its result is shared by every caller in
/// the collapse group.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Absolute request URI. The default equivalence key is its string form.
    pub uri: Uri,
    /// HTTP version.
    pub version: Version,
    /// Request headers.
    pub headers: HeaderMap,
    /// Optional request payload.
    pub body: Option<Bytes>,
    /// Bounds the caller's wait for the response.
    pub cancel: Option<CancellationToken>,
}

impl Request {
    /// Creates a request with the given method and target URI.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: None,
            cancel: None,
        }
    }

    /// Creates a GET request for the given URI.
    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    /// Attaches a request payload.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Bounds the caller's wait for the response with a cancellation token.
    ///
    /// Note: cancelling the token never aborts the upstream fetch or affects
    /// other callers collapsed onto the same key.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// HTTP response as returned by an upstream client or the collapse proxy.
#[derive(Debug)]
pub struct Response {
    /// Response status code.
    pub status: StatusCode,
    /// Reason phrase. Synthesized upstream-failure responses carry the error
    /// text here; `None` falls back to the canonical phrase.
    pub reason: Option<String>,
    /// HTTP version.
    pub version: Version,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body stream.
    pub body: Body,
    /// The request this response answers, echoed back on synthesized errors.
    pub request: Option<Request>,
}

impl Response {
    /// Creates an empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Body::Empty,
            request: None,
        }
    }

    /// Creates an empty response with a custom reason phrase.
    pub fn with_reason(status: StatusCode, reason: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.reason = Some(reason.into());
        response
    }

    /// Synthesizes the response for a failed upstream fetch: a 500 whose
    /// reason phrase is the error text, with the request echoed back.
    pub(crate) fn error(request: Request, reason: impl Into<String>) -> Self {
        let mut response = Self::with_reason(StatusCode::INTERNAL_SERVER_ERROR, reason);
        response.request = Some(request);
        response
    }

    /// Returns a body-stripped copy of this response.
    pub fn head(&self) -> Self {
        Self {
            status: self.status,
            reason: self.reason.clone(),
            version: self.version,
            headers: self.headers.clone(),
            body: Body::Empty,
            request: self.request.clone(),
        }
    }

    /// Returns the reason phrase, falling back to the canonical one.
    pub fn reason(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => self.status.canonical_reason().unwrap_or_default(),
        }
    }
}
