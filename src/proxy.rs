use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use n0_error::stack_error;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker, time::FutureExt};
use tracing::{Instrument, debug, error_span};

use crate::{
    message::{Request, Response},
    upstream::{DynUpstream, Upstream},
};

pub use self::opts::{CollapseOpts, KeyFn};
use self::state::{Attach, ResponseState};

pub(crate) mod opts;
mod state;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors returned by [`CollapseProxy::execute`].
#[stack_error(derive)]
#[non_exhaustive]
pub enum CollapseError {
    /// The request's cancellation token fired before the response arrived.
    #[error("request cancelled while awaiting the collapsed response")]
    Cancelled,
    /// The proxy's lifetime ended before the response was delivered.
    #[error("proxy shut down before the response was delivered")]
    Shutdown,
}

/// HTTP proxy that collapses concurrent equivalent requests.
///
/// Requests resolving to the same equivalence key share a single upstream
/// fetch: the first caller becomes the *leader* and performs the fetch, all
/// later callers become *followers* and receive a copy of the response whose
/// body is a pipe fed from the leader's. Reading the leader's body drives the
/// fan-out, and the slowest follower paces the whole group. Followers may
/// still join after the response has arrived, up to the moment the first body
/// byte is read.
///
/// The proxy implements [`Upstream`] itself, so it can be dropped in front of
/// any client, including another collapse proxy.
///
/// # Usage
///
/// ```ignore
/// let proxy = CollapseProxy::new(ReqwestClient::new(), CollapseOpts::default());
/// let mut response = proxy.execute(Request::get(uri)).await?;
/// let bytes = response.body.collect().await?;
/// ```
#[derive(Clone, Debug)]
pub struct CollapseProxy {
    shared: Arc<Shared>,
}

#[derive(derive_more::Debug)]
struct Shared {
    #[debug("Arc<dyn Upstream>")]
    upstream: Arc<DynUpstream<'static>>,
    #[debug("KeyFn")]
    key: KeyFn,
    pipe_capacity: usize,
    lifetime: CancellationToken,
    tasks: TaskTracker,
    /// Disambiguates retired keys; monotonic so two rekeys of the same key
    /// can never collide.
    rekey_seq: AtomicU64,
    states: Mutex<HashMap<String, Arc<ResponseState>>>,
}

impl CollapseProxy {
    /// Creates a collapse proxy in front of the given upstream client.
    pub fn new(upstream: impl Upstream + 'static, opts: CollapseOpts) -> Self {
        Self {
            shared: Arc::new(Shared {
                upstream: Arc::from(DynUpstream::boxed(upstream)),
                pipe_capacity: opts.pipe_capacity_or_default(),
                key: opts.key.unwrap_or_else(|| Arc::new(opts::default_key)),
                lifetime: opts.lifetime.unwrap_or_default(),
                tasks: TaskTracker::new(),
                rekey_seq: AtomicU64::new(0),
                states: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Executes a request, collapsing it with any equivalent in-flight one.
    ///
    /// Exactly one of the callers sharing a key performs the upstream fetch;
    /// every caller receives the same status, headers and body bytes. If the
    /// request carries a cancellation token and it fires first, this returns
    /// [`CollapseError::Cancelled`] immediately and the response is drained
    /// in the background so the remaining callers are unaffected.
    pub async fn execute(&self, request: Request) -> Result<Response, CollapseError> {
        let cancel = request.cancel.clone();
        let mut delivery = self.submit(request);
        let Some(cancel) = cancel else {
            return delivery.await.map_err(|_| CollapseError::Shutdown);
        };
        tokio::select! {
            delivered = &mut delivery => delivered.map_err(|_| CollapseError::Shutdown),
            _ = cancel.cancelled() => {
                // The fetch belongs to the whole collapse group; drain this
                // caller's delivery so its tee slot is released.
                self.shared.tasks.spawn(async move {
                    if let Ok(mut response) = delivery.await {
                        response.body.close().await.ok();
                    }
                });
                Err(CollapseError::Cancelled)
            }
        }
    }

    /// Cancels the lifetime context and waits briefly for background work.
    pub async fn shutdown(&self) {
        self.shared.lifetime.cancel();
        self.shared.tasks.close();
        debug!("shutting down ({} pending tasks)", self.shared.tasks.len());
        match self
            .shared
            .tasks
            .wait()
            .timeout(GRACEFUL_SHUTDOWN_TIMEOUT)
            .await
        {
            Ok(()) => debug!("all background tasks finished"),
            Err(_) => debug!(
                remaining = self.shared.tasks.len(),
                "background tasks did not finish in time"
            ),
        }
    }

    /// Admits the request as leader or follower and returns its delivery
    /// channel.
    fn submit(&self, request: Request) -> oneshot::Receiver<Response> {
        let key = (self.shared.key)(&request);
        let (tx, rx) = oneshot::channel();
        let mut waiter = tx;
        loop {
            let (entry, leader) = {
                let mut states = self.shared.states.lock().expect("states lock poisoned");
                match states.get(&key) {
                    Some(entry) => (Arc::clone(entry), false),
                    None => {
                        let entry = Arc::new(ResponseState::new(
                            key.clone(),
                            self.shared.pipe_capacity,
                        ));
                        states.insert(key.clone(), Arc::clone(&entry));
                        (entry, true)
                    }
                }
            };
            if leader {
                debug!(%key, "leading a new upstream fetch");
                self.spawn_dispatch(key, entry, request, waiter);
                return rx;
            }
            match entry.attach(waiter) {
                Attach::Joined => {
                    debug!(%key, "joined an in-flight fetch");
                    return rx;
                }
                Attach::Sealed(returned) => {
                    // The body already leaked bytes; move the sealed state
                    // aside so a fresh fetch can take over the key. Current
                    // followers keep streaming from the retired state.
                    waiter = returned;
                    self.rekey(&key, &entry);
                }
            }
        }
    }

    /// Moves a sealed state to a private single-use key, freeing `key` for a
    /// new collapse group.
    fn rekey(&self, key: &str, entry: &Arc<ResponseState>) {
        let mut states = self.shared.states.lock().expect("states lock poisoned");
        match states.get(key) {
            Some(current) if Arc::ptr_eq(current, entry) => {}
            // Another caller already swapped it out; retry the lookup.
            _ => return,
        }
        let retired = format!(
            "{key}#{}",
            self.shared.rekey_seq.fetch_add(1, Ordering::Relaxed)
        );
        debug!(%key, %retired, "rekeying sealed state");
        if let Some(state) = states.remove(key) {
            state.set_key(retired.clone());
            states.insert(retired, state);
        }
    }

    /// Runs the upstream fetch and the fan-out in a background task bound to
    /// the proxy's lifetime, delivering the leader's view on `leader`.
    fn spawn_dispatch(
        &self,
        key: String,
        entry: Arc<ResponseState>,
        mut request: Request,
        leader: oneshot::Sender<Response>,
    ) {
        // The fetch serves every follower, so it is bound to the proxy
        // lifetime, never to the leader's own cancellation.
        request.cancel = None;
        let shared = Arc::clone(&self.shared);
        self.shared.tasks.spawn(
            async move {
                let lifetime = shared.lifetime.clone();
                let response = match lifetime
                    .run_until_cancelled(shared.upstream.execute(request.clone()))
                    .await
                {
                    None => {
                        debug!("proxy shut down while awaiting upstream");
                        shared.retire(&entry);
                        return;
                    }
                    Some(Ok(response)) => response,
                    Some(Err(err)) => {
                        debug!("upstream failed: {err:#}");
                        Response::error(request, err.to_string())
                    }
                };
                let on_close = {
                    let shared = Arc::downgrade(&shared);
                    let entry = Arc::clone(&entry);
                    Box::new(move || {
                        if let Some(shared) = shared.upgrade() {
                            shared.retire(&entry);
                        }
                    }) as Box<dyn FnOnce() + Send>
                };
                let response = match entry.handle_response(&lifetime, response, on_close) {
                    Ok(response) => response,
                    Err(_) => {
                        debug!("fan-out aborted at shutdown");
                        shared.retire(&entry);
                        return;
                    }
                };
                if !entry.has_tee() {
                    // Nothing is streaming, so there is no late-join window
                    // to keep the entry alive for.
                    shared.retire(&entry);
                }
                leader.send(response).ok();
            }
            .instrument(error_span!("dispatch", %key)),
        );
    }
}

impl Shared {
    /// Drops the registry entry for a finished or abandoned state.
    fn retire(&self, entry: &Arc<ResponseState>) {
        let mut states = self.states.lock().expect("states lock poisoned");
        let key = entry.current_key();
        if states
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            debug!(%key, "retiring response state");
            states.remove(&key);
        }
    }
}
