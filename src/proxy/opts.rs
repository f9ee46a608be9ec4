use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{DEFAULT_PIPE_CAPACITY, message::Request};

/// Computes the equivalence key that groups requests for collapsing.
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// The default equivalence key: the absolute request URL.
pub(crate) fn default_key(request: &Request) -> String {
    request.uri.to_string()
}

/// Options for a [`CollapseProxy`](crate::CollapseProxy).
#[derive(derive_more::Debug, Clone, Default)]
pub struct CollapseOpts {
    #[debug("{:?}", key.as_ref().map(|_| "KeyFn"))]
    pub(crate) key: Option<KeyFn>,
    pub(crate) pipe_capacity: Option<usize>,
    pub(crate) lifetime: Option<CancellationToken>,
}

impl CollapseOpts {
    /// Overrides the request equivalence function.
    ///
    /// Requests mapping to the same key are treated as identical and
    /// collapsed onto one upstream fetch. The default keys requests by their
    /// absolute URL; override this to ignore query parameters, fold in a
    /// header, or otherwise widen or narrow what counts as equivalent.
    pub fn key(mut self, key: impl Fn(&Request) -> String + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    /// Sets the per-follower pipe capacity in bytes.
    ///
    /// This is the back-pressure window between the tee and each follower: a
    /// follower may lag the leader by at most this many bytes before it
    /// stalls the whole collapse group. Defaults to 8 KiB.
    pub fn pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = Some(capacity);
        self
    }

    /// Binds all background work to an externally supplied lifetime token.
    ///
    /// Cancelling the token tears the proxy down: in-flight upstream fetches
    /// and fan-outs are abandoned and pending callers receive an error. When
    /// unset the proxy owns its lifetime and is torn down via
    /// [`shutdown`](crate::CollapseProxy::shutdown).
    pub fn lifetime(mut self, token: CancellationToken) -> Self {
        self.lifetime = Some(token);
        self
    }

    pub(crate) fn pipe_capacity_or_default(&self) -> usize {
        self.pipe_capacity.unwrap_or(DEFAULT_PIPE_CAPACITY)
    }
}
