//! Proxy windows: cacheable, comparable, serializable stand-ins for remote
//! contexts, bound to a live handle once identity matching succeeds.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, OnceCell};
use tracing::debug;
use uuid::Uuid;

use crate::capability::{
    InstanceIdentity, LocalCapability, MethodCall, WindowCapability, WindowMethod,
};
use crate::domain::DomainPattern;
use crate::window::{Handle, HandleId, WindowError};

/// Process-unique proxy id; the only part of a proxy that crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyId(String);

impl ProxyId {
    fn mint() -> Self {
        ProxyId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProxyId {
    fn from(id: &str) -> Self {
        ProxyId(id.to_string())
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a peer puts in a payload in place of a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDescriptor {
    pub id: ProxyId,
}

/// A stub: the proxy id plus the capability that acts on the window.
#[derive(Debug, Clone)]
pub struct SerializedWindow {
    pub id: ProxyId,
    pub capability: Arc<dyn WindowCapability>,
}

impl SerializedWindow {
    pub fn descriptor(&self) -> WindowDescriptor {
        WindowDescriptor {
            id: self.id.clone(),
        }
    }
}

/// Either side of [`ProxyRegistry::serialize`].
#[derive(Debug, Clone)]
pub enum WindowRef {
    Handle(Handle),
    Proxy(ProxyWindow),
}

impl From<Handle> for WindowRef {
    fn from(handle: Handle) -> Self {
        WindowRef::Handle(handle)
    }
}

impl From<ProxyWindow> for WindowRef {
    fn from(proxy: ProxyWindow) -> Self {
        WindowRef::Proxy(proxy)
    }
}

/// Result of [`ProxyWindow::unwrap`].
#[derive(Debug, Clone)]
pub enum Unwrapped {
    Window(Handle),
    Proxy(ProxyWindow),
}

struct ProxyInner {
    id: ProxyId,
    stub: Arc<dyn WindowCapability>,
    ids: Arc<dyn InstanceIdentity>,
    // Written once, by `bind`.
    bound: watch::Sender<Option<Handle>>,
    instance_id: OnceCell<String>,
    stale: AtomicBool,
}

/// Handle-like view of a remote context. Clones share one identity; compare
/// with `==`.
#[derive(Clone)]
pub struct ProxyWindow {
    inner: Arc<ProxyInner>,
}

impl ProxyWindow {
    fn new(
        id: ProxyId,
        stub: Arc<dyn WindowCapability>,
        ids: Arc<dyn InstanceIdentity>,
        bound: Option<Handle>,
    ) -> Self {
        let (bound, _) = watch::channel(bound);
        Self {
            inner: Arc::new(ProxyInner {
                id,
                stub,
                ids,
                bound,
                instance_id: OnceCell::new(),
                stale: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &ProxyId {
        &self.inner.id
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound.borrow().is_some()
    }

    /// The bound live handle, if any.
    pub fn window(&self) -> Option<Handle> {
        self.inner.bound.borrow().clone()
    }

    /// Wait until the proxy is bound to a live handle.
    pub async fn await_window(&self) -> Handle {
        let mut rx = self.inner.bound.subscribe();
        loop {
            if let Some(handle) = rx.borrow_and_update().as_ref() {
                return handle.clone();
            }
            // The sender lives in `self`, so this only returns on a change.
            let _ = rx.changed().await;
        }
    }

    /// The live handle when bound, otherwise the proxy itself.
    pub fn unwrap(&self) -> Unwrapped {
        match self.window() {
            Some(handle) => Unwrapped::Window(handle),
            None => Unwrapped::Proxy(self.clone()),
        }
    }

    pub fn serialize(&self) -> SerializedWindow {
        SerializedWindow {
            id: self.inner.id.clone(),
            capability: self.inner.stub.clone(),
        }
    }

    /// Flagged by a cleanup sweep after its handle closed.
    pub fn is_stale(&self) -> bool {
        self.inner.stale.load(Ordering::SeqCst)
    }

    /// Bind to `handle` unless already bound. Returns whether the proxy is now
    /// bound to `handle`.
    fn bind(&self, handle: &Handle) -> bool {
        self.inner.bound.send_if_modified(|slot| match slot {
            Some(_) => false,
            None => {
                *slot = Some(handle.clone());
                true
            }
        });
        self.inner.bound.borrow().as_ref() == Some(handle)
    }

    fn flag_if_closed(&self) -> bool {
        let closed = self.inner.bound.borrow().as_ref().is_some_and(Handle::is_closed);
        if closed {
            self.inner.stale.store(true, Ordering::SeqCst);
        }
        closed
    }

    fn capability(&self) -> Result<Arc<dyn WindowCapability>, WindowError> {
        if self.is_stale() {
            return Err(WindowError::Closed);
        }
        Ok(match self.window() {
            Some(handle) => Arc::new(LocalCapability::new(handle, self.inner.ids.clone())),
            None => self.inner.stub.clone(),
        })
    }

    pub async fn close(&self) -> Result<(), WindowError> {
        self.capability()?.close().await
    }

    pub async fn focus(&self) -> Result<(), WindowError> {
        self.capability()?.focus().await
    }

    pub async fn is_closed(&self) -> Result<bool, WindowError> {
        if self.is_stale() {
            return Ok(true);
        }
        self.capability()?.is_closed().await
    }

    pub async fn set_location(&self, href: &str) -> Result<(), WindowError> {
        self.capability()?.set_location(href).await
    }

    pub async fn set_name(&self, name: &str) -> Result<(), WindowError> {
        self.capability()?.set_name(name).await
    }

    /// Instance id of the context behind the proxy, looked up at most once.
    pub async fn instance_id(&self) -> Result<String, WindowError> {
        if let Some(id) = self.inner.instance_id.get() {
            return Ok(id.clone());
        }
        let capability = self.capability()?;
        self.inner
            .instance_id
            .get_or_try_init(|| capability.instance_id())
            .await
            .cloned()
    }

    /// Run a forwarded capability call and encode its result.
    pub async fn call(&self, call: &MethodCall) -> Result<Value, WindowError> {
        Ok(match call.name {
            WindowMethod::Close => {
                self.close().await?;
                Value::Null
            }
            WindowMethod::Focus => {
                self.focus().await?;
                Value::Null
            }
            WindowMethod::IsClosed => Value::Bool(self.is_closed().await?),
            WindowMethod::SetLocation => {
                self.set_location(call.str_arg()?).await?;
                Value::Null
            }
            WindowMethod::SetName => {
                self.set_name(call.str_arg()?).await?;
                Value::Null
            }
            WindowMethod::InstanceId => Value::String(self.instance_id().await?),
        })
    }
}

impl PartialEq for ProxyWindow {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ProxyWindow {}

impl fmt::Debug for ProxyWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyWindow")
            .field("id", &self.inner.id)
            .field("window", &self.window().map(|h| h.id()))
            .field("stale", &self.is_stale())
            .finish()
    }
}

#[derive(Default)]
struct Proxies {
    by_handle: HashMap<HandleId, ProxyWindow>,
    by_id: HashMap<ProxyId, ProxyWindow>,
    exports: HashMap<ProxyId, DomainPattern>,
}

impl Proxies {
    /// Evict every proxy whose bound handle is confirmed closed.
    fn sweep(&mut self) {
        let Proxies {
            by_handle,
            by_id,
            exports,
        } = self;
        by_handle.retain(|_, proxy| !proxy.flag_if_closed());
        by_id.retain(|id, proxy| {
            if proxy.flag_if_closed() {
                debug!(proxy = %id, "evicting closed window");
                exports.remove(id);
                return false;
            }
            true
        });
    }
}

/// Identity caches for proxies: at most one proxy per live handle and one per
/// id.
pub struct ProxyRegistry {
    ids: Arc<dyn InstanceIdentity>,
    proxies: Mutex<Proxies>,
}

impl ProxyRegistry {
    pub fn new(ids: Arc<dyn InstanceIdentity>) -> Self {
        Self {
            ids,
            proxies: Mutex::new(Proxies::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Proxies> {
        let mut proxies = self.proxies.lock().unwrap_or_else(PoisonError::into_inner);
        proxies.sweep();
        proxies
    }

    /// Proxy for a live handle; the same one on every call.
    pub fn wrap(&self, handle: &Handle) -> ProxyWindow {
        let mut proxies = self.lock();
        if let Some(proxy) = proxies.by_handle.get(&handle.id()) {
            return proxy.clone();
        }
        let stub = Arc::new(LocalCapability::new(handle.clone(), self.ids.clone()));
        let proxy = ProxyWindow::new(ProxyId::mint(), stub, self.ids.clone(), Some(handle.clone()));
        proxies.by_handle.insert(handle.id(), proxy.clone());
        proxies.by_id.insert(proxy.id().clone(), proxy.clone());
        proxy
    }

    /// Proxy for a received stub; the same one for every stub with this id.
    pub fn from_stub(&self, stub: SerializedWindow) -> ProxyWindow {
        let mut proxies = self.lock();
        if let Some(proxy) = proxies.by_id.get(&stub.id) {
            return proxy.clone();
        }
        let proxy = ProxyWindow::new(stub.id.clone(), stub.capability, self.ids.clone(), None);
        proxies.by_id.insert(stub.id, proxy.clone());
        proxy
    }

    pub fn serialize(&self, window: impl Into<WindowRef>) -> SerializedWindow {
        match window.into() {
            WindowRef::Handle(handle) => self.wrap(&handle).serialize(),
            WindowRef::Proxy(proxy) => proxy.serialize(),
        }
    }

    /// Whether `candidate` is the context behind `proxy`. A bound proxy
    /// compares handles; an unbound one compares instance ids and binds to
    /// `candidate` when they are equal.
    ///
    /// Binding does not check whether `candidate` is already owned: if
    /// [`wrap`](Self::wrap) handed it to another proxy, both end up bound to
    /// the same handle. The handle index keeps its first owner, so `wrap`
    /// keeps returning that proxy.
    pub async fn match_window(
        &self,
        proxy: &ProxyWindow,
        candidate: &Handle,
    ) -> Result<bool, WindowError> {
        if let Some(bound) = proxy.window() {
            return Ok(bound == *candidate);
        }
        let (theirs, ours) =
            tokio::try_join!(proxy.instance_id(), self.ids.instance_id(candidate))?;
        if theirs != ours {
            return Ok(false);
        }
        let bound = proxy.bind(candidate);
        if bound {
            debug!(proxy = %proxy.id(), handle = %candidate.id(), "bound proxy");
            self.lock()
                .by_handle
                .entry(candidate.id())
                .or_insert_with(|| proxy.clone());
        }
        Ok(bound)
    }

    pub fn get(&self, id: &ProxyId) -> Option<ProxyWindow> {
        self.lock().by_id.get(id).cloned()
    }

    /// Allow peers at `domain` to call capabilities of proxy `id`.
    pub fn export(&self, id: &ProxyId, domain: DomainPattern) {
        self.lock().exports.insert(id.clone(), domain);
    }

    /// Exported proxy `id` and the domain it was exported to.
    pub fn exported(&self, id: &ProxyId) -> Option<(ProxyWindow, DomainPattern)> {
        let proxies = self.lock();
        let proxy = proxies.by_id.get(id)?.clone();
        let domain = proxies.exports.get(id)?.clone();
        Some((proxy, domain))
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
