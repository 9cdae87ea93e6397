//! In-memory windows and transports for tests. Deliveries sit in per-endpoint
//! inboxes until a test pumps them, so loss and duplication are explicit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::Peer;
use crate::protocol::Message;
use crate::transport::{Transport, TransportError};
use crate::window::{Handle, HandleId, Window, WindowError};

#[derive(Debug)]
pub struct MemoryWindow {
    origin: String,
    same_domain: AtomicBool,
    replace_supported: AtomicBool,
    closed: AtomicBool,
    focus_count: AtomicUsize,
    history: Mutex<Vec<String>>,
    name: Mutex<String>,
    frame_name: Mutex<Option<String>>,
}

impl MemoryWindow {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.to_string(),
            same_domain: AtomicBool::new(true),
            replace_supported: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            focus_count: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
            name: Mutex::new(String::new()),
            frame_name: Mutex::new(None),
        }
    }

    pub fn cross_domain(self) -> Self {
        self.same_domain.store(false, Ordering::SeqCst);
        self
    }

    pub fn without_replace(self) -> Self {
        self.replace_supported.store(false, Ordering::SeqCst);
        self
    }

    pub fn in_frame(self) -> Self {
        *self.frame_name.lock().unwrap() = Some(String::new());
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn location(&self) -> Option<String> {
        self.history.lock().unwrap().last().cloned()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn frame_name(&self) -> Option<String> {
        self.frame_name.lock().unwrap().clone()
    }

    pub fn focus_count(&self) -> usize {
        self.focus_count.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), WindowError> {
        if self.is_closed() {
            return Err(WindowError::Closed);
        }
        Ok(())
    }
}

impl Window for MemoryWindow {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<(), WindowError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn focus(&self) -> Result<(), WindowError> {
        self.ensure_open()?;
        self.focus_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_same_domain(&self) -> bool {
        self.same_domain.load(Ordering::SeqCst)
    }

    fn replace_location(&self, href: &str) -> Result<(), WindowError> {
        self.ensure_open()?;
        if !self.replace_supported.load(Ordering::SeqCst) {
            return Err(WindowError::Unsupported {
                operation: "replace_location",
            });
        }
        let mut history = self.history.lock().unwrap();
        match history.last_mut() {
            Some(current) => *current = href.to_string(),
            None => history.push(href.to_string()),
        }
        Ok(())
    }

    fn assign_location(&self, href: &str) -> Result<(), WindowError> {
        self.ensure_open()?;
        self.history.lock().unwrap().push(href.to_string());
        Ok(())
    }

    fn set_name(&self, name: &str) -> Result<(), WindowError> {
        self.ensure_open()?;
        *self.name.lock().unwrap() = name.to_string();
        Ok(())
    }

    fn set_frame_name(&self, name: &str) -> Result<bool, WindowError> {
        let mut frame = self.frame_name.lock().unwrap();
        match frame.as_mut() {
            Some(current) => {
                *current = name.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Records every outbound message instead of delivering it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Handle, String, Message)>>,
    fail: AtomicBool,
    yielding: AtomicBool,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(Handle, String, Message)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Suspend once inside every send, like a socket that is not yet writable.
    pub fn yield_on_send(&self, yielding: bool) {
        self.yielding.store(yielding, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_message(
        &self,
        destination: &Handle,
        target_origin: &str,
        message: Message,
    ) -> Result<(), TransportError> {
        if self.yielding.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("send disabled".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination.clone(), target_origin.to_string(), message));
        Ok(())
    }
}

/// One message as seen by the receiving endpoint.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub source: Handle,
    pub origin: String,
    pub message: Message,
}

/// A context on the in-memory network: its origin and its inbox.
pub struct Endpoint {
    origin: String,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

impl Endpoint {
    pub fn new(origin: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            origin: origin.to_string(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Wait for the next delivery.
    pub async fn next(&self) -> Option<Delivery> {
        self.rx.lock().await.recv().await
    }

    pub fn try_next(&self) -> Option<Delivery> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Feed the next `n` deliveries into `peer`. Dispatch errors are returned
    /// in arrival order.
    pub async fn pump(&self, peer: &Peer, n: usize) -> Vec<crate::dispatch::DispatchError> {
        let mut errors = Vec::new();
        for _ in 0..n {
            let Some(d) = self.next().await else { break };
            if let Err(err) = peer.receive(&d.source, &d.origin, d.message).await {
                errors.push(err);
            }
        }
        errors
    }
}

/// Deliver everything arriving at `endpoint` to `peer`, each message on its
/// own task so handlers that send requests of their own can make progress.
pub fn serve(endpoint: Arc<Endpoint>, peer: Arc<Peer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(d) = endpoint.next().await {
            let peer = peer.clone();
            tokio::spawn(async move {
                let _ = peer.receive(&d.source, &d.origin, d.message).await;
            });
        }
    })
}

struct Route {
    inbox: mpsc::UnboundedSender<Delivery>,
    sender_origin: String,
    destination_origin: String,
    reply_as: Handle,
}

/// Shared transport for every endpoint of one test.
#[derive(Default)]
pub struct MemoryNetwork {
    routes: Mutex<HashMap<HandleId, Route>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect `a` and `b`. Returns (a's handle to b, b's handle to a) and
    /// the windows behind them.
    pub fn link(
        &self,
        a: &Endpoint,
        b: &Endpoint,
    ) -> ((Handle, Arc<MemoryWindow>), (Handle, Arc<MemoryWindow>)) {
        let b_window = Arc::new(MemoryWindow::new(&b.origin));
        let a_window = Arc::new(MemoryWindow::new(&a.origin));
        let to_b = Handle::from_arc(b_window.clone());
        let to_a = Handle::from_arc(a_window.clone());
        let mut routes = self.routes.lock().unwrap();
        routes.insert(
            to_b.id(),
            Route {
                inbox: b.tx.clone(),
                sender_origin: a.origin.clone(),
                destination_origin: b.origin.clone(),
                reply_as: to_a.clone(),
            },
        );
        routes.insert(
            to_a.id(),
            Route {
                inbox: a.tx.clone(),
                sender_origin: b.origin.clone(),
                destination_origin: a.origin.clone(),
                reply_as: to_b.clone(),
            },
        );
        ((to_b, b_window), (to_a, a_window))
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn send_message(
        &self,
        destination: &Handle,
        target_origin: &str,
        message: Message,
    ) -> Result<(), TransportError> {
        if destination.is_closed() {
            return Ok(());
        }
        let routes = self.routes.lock().unwrap();
        let route = routes
            .get(&destination.id())
            .ok_or_else(|| TransportError::Rejected("unknown destination".into()))?;
        if target_origin != "*" && target_origin != route.destination_origin {
            return Ok(());
        }
        let _ = route.inbox.send(Delivery {
            source: route.reply_as.clone(),
            origin: route.sender_origin.clone(),
            message,
        });
        Ok(())
    }
}
