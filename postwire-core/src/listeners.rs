//! Listener registry: request handlers by name/window/domain, pending
//! responses by hash, and the set of hashes that already failed.
//!
//! Every method takes the lock once and releases it before returning, so a
//! lookup and the mutation that follows it can not interleave with another
//! dispatch of the same hash.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::dispatch::DispatchError;
use crate::domain::DomainPattern;
use crate::window::Handle;

/// What a handler sees of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub source: Handle,
    pub origin: String,
    pub data: Option<Value>,
}

/// Handler outcome: `Ok(data)` becomes a success response, `Err(payload)` an
/// error response carrying `payload` as is.
pub type HandlerFuture = BoxFuture<'static, Result<Value, Value>>;

pub type Handler = Arc<dyn Fn(RequestContext) -> HandlerFuture + Send + Sync>;

/// Box an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Value>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Receives errors raised while sending the ack or response for a request.
pub type ErrorHook = Arc<dyn Fn(DispatchError) + Send + Sync>;

/// Registration options for a request listener.
#[derive(Clone, Default)]
pub struct ListenOptions {
    /// Only serve requests from this handle; `None` serves any source.
    pub window: Option<Handle>,
    pub domain: DomainPattern,
    pub handle_error: Option<ErrorHook>,
}

impl fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenOptions")
            .field("window", &self.window)
            .field("domain", &self.domain)
            .field("handle_error", &self.handle_error.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct RequestListener {
    id: u64,
    pub name: String,
    pub window: Option<Handle>,
    pub domain: DomainPattern,
    pub handler: Handler,
    pub handle_error: Option<ErrorHook>,
}

impl fmt::Debug for RequestListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestListener")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("window", &self.window)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Resolved value of a successful request.
#[derive(Debug, Clone)]
pub struct Response {
    pub source: Handle,
    pub origin: String,
    pub data: Value,
}

/// Single-resolution continuation of a pending request.
pub type Resolver = oneshot::Sender<Result<Response, Value>>;

/// Pending request on the sending side.
#[derive(Debug)]
pub struct ResponseListener {
    pub name: String,
    /// Handle the request was sent to; replies must come from it.
    pub window: Handle,
    pub domain: DomainPattern,
    /// Set once a valid ack arrived.
    pub ack: bool,
    /// Fired on the first valid ack.
    pub on_ack: Option<oneshot::Sender<()>>,
    pub resolver: Resolver,
}

impl ResponseListener {
    /// Record a valid ack and wake whoever waits for it.
    pub fn acknowledge(&mut self) {
        self.ack = true;
        if let Some(tx) = self.on_ack.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("request listener already exists for {name} on domain {domain}")]
    AlreadyExists { name: String, domain: String },
}

/// How long a given-up hash keeps discarding late replies.
pub const ERRORED_RETENTION: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Inner {
    next_id: u64,
    requests: HashMap<String, Vec<RequestListener>>,
    responses: HashMap<String, ResponseListener>,
    /// Errored hash to the time it stops counting.
    errored: HashMap<String, Instant>,
}

impl Inner {
    fn is_errored(&self, hash: &str) -> bool {
        self.errored
            .get(hash)
            .is_some_and(|until| *until > Instant::now())
    }
}

#[derive(Default)]
pub struct Listeners {
    inner: Mutex<Inner>,
}

impl Listeners {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request handler. Fails if one already exists for the same
    /// name, window and domain.
    pub fn add_request_listener(
        self: &Arc<Self>,
        name: &str,
        options: ListenOptions,
        handler: Handler,
    ) -> Result<ListenerHandle, ListenerError> {
        let mut inner = self.lock();
        let existing = inner.requests.get(name).is_some_and(|list| {
            list.iter()
                .any(|l| l.window == options.window && l.domain == options.domain)
        });
        if existing {
            return Err(ListenerError::AlreadyExists {
                name: name.to_string(),
                domain: options.domain.to_string(),
            });
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .requests
            .entry(name.to_string())
            .or_default()
            .push(RequestListener {
                id,
                name: name.to_string(),
                window: options.window,
                domain: options.domain,
                handler,
                handle_error: options.handle_error,
            });
        Ok(ListenerHandle {
            listeners: Arc::downgrade(self),
            name: name.to_string(),
            id,
        })
    }

    fn remove_request_listener(&self, name: &str, id: u64) -> bool {
        let mut inner = self.lock();
        let Some(list) = inner.requests.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| l.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.requests.remove(name);
        }
        removed
    }

    /// Find the listener for a request named `name` from `source` at `origin`.
    ///
    /// Window-specific listeners win over wildcard ones; among those, a
    /// listener whose domain accepts `origin` wins (exact origin, then other
    /// patterns, then `*`; newest first). When none accepts `origin` the newest
    /// candidate is returned anyway so the caller reports a domain mismatch.
    pub fn request_listener(
        &self,
        name: &str,
        source: &Handle,
        origin: &str,
    ) -> Option<RequestListener> {
        let inner = self.lock();
        let candidates = inner.requests.get(name)?;
        for specific in [true, false] {
            let best = candidates
                .iter()
                .rev()
                .filter(|l| in_scope(l, source, specific) && l.domain.matches(origin))
                .min_by_key(|l| domain_rank(&l.domain, origin));
            if let Some(listener) = best {
                return Some(listener.clone());
            }
        }
        [true, false].into_iter().find_map(|specific| {
            candidates
                .iter()
                .rev()
                .find(|l| in_scope(l, source, specific))
                .cloned()
        })
    }

    pub fn add_response_listener(&self, hash: &str, listener: ResponseListener) {
        self.lock().responses.insert(hash.to_string(), listener);
    }

    /// Run `f` on the pending listener for `hash`. `None` if the hash already
    /// errored or nothing is pending.
    pub fn with_response_listener<R>(
        &self,
        hash: &str,
        f: impl FnOnce(&mut ResponseListener) -> R,
    ) -> Option<R> {
        let mut inner = self.lock();
        if inner.is_errored(hash) {
            return None;
        }
        inner.responses.get_mut(hash).map(f)
    }

    /// Remove and return the pending listener for `hash` once `validate`
    /// accepts it. `Ok(None)` if the hash already errored or nothing is pending.
    pub fn take_response_listener<E>(
        &self,
        hash: &str,
        validate: impl FnOnce(&ResponseListener) -> Result<(), E>,
    ) -> Result<Option<ResponseListener>, E> {
        let mut inner = self.lock();
        if inner.is_errored(hash) {
            return Ok(None);
        }
        let Some(listener) = inner.responses.get(hash) else {
            return Ok(None);
        };
        validate(listener)?;
        Ok(inner.responses.remove(hash))
    }

    pub fn delete_response_listener(&self, hash: &str) -> Option<ResponseListener> {
        self.lock().responses.remove(hash)
    }

    /// Give up on `hash`: drop its listener and discard any later ack/response
    /// for [`ERRORED_RETENTION`]. Expired hashes are pruned here.
    pub fn mark_response_listener_errored(&self, hash: &str) -> Option<ResponseListener> {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.errored.retain(|_, until| *until > now);
        inner
            .errored
            .insert(hash.to_string(), now + ERRORED_RETENTION);
        inner.responses.remove(hash)
    }

    pub fn is_response_listener_errored(&self, hash: &str) -> bool {
        self.lock().is_errored(hash)
    }

    pub fn errored_hashes(&self) -> usize {
        self.lock().errored.len()
    }

    pub fn is_acknowledged(&self, hash: &str) -> bool {
        self.lock().responses.get(hash).is_some_and(|l| l.ack)
    }

    pub fn pending_responses(&self) -> usize {
        self.lock().responses.len()
    }
}

fn in_scope(listener: &RequestListener, source: &Handle, specific: bool) -> bool {
    match &listener.window {
        Some(win) => specific && win == source,
        None => !specific,
    }
}

fn domain_rank(domain: &DomainPattern, origin: &str) -> u8 {
    match domain {
        DomainPattern::Exact(d) if d == origin => 0,
        DomainPattern::Any => 2,
        _ => 1,
    }
}

/// Returned by registration; `cancel` removes the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    listeners: Weak<Listeners>,
    name: String,
    id: u64,
}

impl ListenerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn cancel(self) -> bool {
        match self.listeners.upgrade() {
            Some(listeners) => listeners.remove_request_listener(&self.name, self.id),
            None => false,
        }
    }
}
