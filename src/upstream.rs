use std::io;

use dynosaur::dynosaur;
use n0_error::{AnyError, StdResultExt};
use n0_future::stream::StreamExt;
use tokio_util::io::StreamReader;

use crate::{
    body::Body,
    message::{Request, Response},
    proxy::CollapseProxy,
};

#[dynosaur(pub(crate) DynUpstream = dyn Upstream)]
/// A client that executes an HTTP request against an origin.
///
/// The collapse proxy sits in front of any implementation of this trait and
/// implements it itself, so proxies compose with plain clients and with each
/// other.
pub trait Upstream: Send + Sync {
    /// Executes the request and returns the origin's response.
    fn execute(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Response, AnyError>> + Send;
}

impl Upstream for CollapseProxy {
    async fn execute(&self, request: Request) -> Result<Response, AnyError> {
        CollapseProxy::execute(self, request).await.anyerr()
    }
}

/// Upstream client backed by a [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with default reqwest settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing reqwest client, keeping its pool and timeouts.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Upstream for ReqwestClient {
    async fn execute(&self, request: Request) -> Result<Response, AnyError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.uri.to_string())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let upstream = builder.send().await.anyerr()?;

        let mut response = Response::new(upstream.status());
        response.version = upstream.version();
        response.headers = upstream.headers().clone();
        let stream = upstream
            .bytes_stream()
            .map(|chunk| chunk.map_err(io::Error::other));
        response.body = Body::from_reader(StreamReader::new(Box::pin(stream)));
        response.request = Some(request);
        Ok(response)
    }
}
