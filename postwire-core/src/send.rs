//! Sending side: issue requests and wait for their single response.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capability::InstanceIdentity;
use crate::domain::DomainPattern;
use crate::listeners::{Listeners, Response, ResponseListener};
use crate::protocol::{Message, RequestMessage, INSTANCE_ID_MESSAGE_NAME};
use crate::transport::{Transport, TransportError};
use crate::window::{Handle, HandleId, WindowError};

/// Per-request timeouts. `None` waits forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub ack_timeout: Option<Duration>,
    /// Counted from the ack (or from the send when there is no ack timeout).
    pub response_timeout: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("window for {name} is closed")]
    WindowClosed { name: String },
    #[error("failed to send {name}: {source}")]
    Transport {
        name: String,
        #[source]
        source: TransportError,
    },
    #[error("no ack for {name} in {timeout:?}")]
    NoAck { name: String, timeout: Duration },
    #[error("no response for {name} in {timeout:?}")]
    NoResponse { name: String, timeout: Duration },
    /// The peer answered with an error response; `error` is its payload.
    #[error("{name} failed remotely: {error}")]
    Remote { name: String, error: Value },
    #[error("pending response for {name} was dropped")]
    Dropped { name: String },
}

type Outcome = Result<Result<Response, Value>, oneshot::error::RecvError>;

pub struct Requester {
    listeners: Arc<Listeners>,
    transport: Arc<dyn Transport>,
    defaults: SendOptions,
    /// Answers to `postwire_get_instance_id`, dropped once the handle closes.
    instance_ids: Mutex<HashMap<HandleId, (Handle, String)>>,
}

impl Requester {
    pub fn new(
        listeners: Arc<Listeners>,
        transport: Arc<dyn Transport>,
        defaults: SendOptions,
    ) -> Self {
        Self {
            listeners,
            transport,
            defaults,
            instance_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn defaults(&self) -> SendOptions {
        self.defaults
    }

    /// Send request `name` to `target` and wait for its response. The pending
    /// listener is registered before the request leaves, and only replies from
    /// `target` at an origin matching `domain` are honored.
    pub async fn send(
        &self,
        target: &Handle,
        domain: DomainPattern,
        name: &str,
        data: Option<Value>,
        options: SendOptions,
    ) -> Result<Response, SendError> {
        if target.is_closed() {
            return Err(SendError::WindowClosed {
                name: name.to_string(),
            });
        }
        let hash = format!("{name}_{}", Uuid::new_v4().simple());
        let target_origin = domain.target_origin().to_string();
        let (resolver, rx) = oneshot::channel();
        let (on_ack, acked) = oneshot::channel();
        self.listeners.add_response_listener(
            &hash,
            ResponseListener {
                name: name.to_string(),
                window: target.clone(),
                domain,
                ack: false,
                on_ack: Some(on_ack),
                resolver,
            },
        );
        debug!(name, hash = %hash, target_origin = %target_origin, "send::req");

        let request = Message::Request(RequestMessage {
            hash: hash.clone(),
            name: name.to_string(),
            data,
            fire_and_forget: false,
        });
        if let Err(source) = self
            .transport
            .send_message(target, &target_origin, request)
            .await
        {
            self.listeners.mark_response_listener_errored(&hash);
            return Err(SendError::Transport {
                name: name.to_string(),
                source,
            });
        }
        self.await_response(&hash, name, rx, acked, options).await
    }

    async fn await_response(
        &self,
        hash: &str,
        name: &str,
        mut rx: oneshot::Receiver<Result<Response, Value>>,
        acked: oneshot::Receiver<()>,
        options: SendOptions,
    ) -> Result<Response, SendError> {
        if let Some(timeout) = options.ack_timeout {
            let first = tokio::time::timeout(timeout, async {
                tokio::select! {
                    biased;
                    outcome = &mut rx => Some(outcome),
                    // Err means the listener is gone; `rx` settles next.
                    _ = acked => None,
                }
            })
            .await;
            match first {
                Ok(Some(outcome)) => return settle(name, outcome),
                Ok(None) => {}
                Err(_) => {
                    // A response that landed in the same instant still counts.
                    if let Ok(outcome) = rx.try_recv() {
                        return settle(name, Ok(outcome));
                    }
                    if !self.listeners.is_acknowledged(hash) {
                        warn!(name, hash, ?timeout, "no ack");
                        self.listeners.mark_response_listener_errored(hash);
                        return Err(SendError::NoAck {
                            name: name.to_string(),
                            timeout,
                        });
                    }
                }
            }
        }
        match options.response_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut rx).await {
                Ok(outcome) => settle(name, outcome),
                Err(_) => {
                    warn!(name, hash, ?timeout, "no response");
                    self.listeners.mark_response_listener_errored(hash);
                    Err(SendError::NoResponse {
                        name: name.to_string(),
                        timeout,
                    })
                }
            },
            None => settle(name, rx.await),
        }
    }

    /// Send without expecting an ack or response. Nothing is registered.
    pub async fn send_fire_and_forget(
        &self,
        target: &Handle,
        domain: &DomainPattern,
        name: &str,
        data: Option<Value>,
    ) -> Result<(), SendError> {
        if target.is_closed() {
            return Err(SendError::WindowClosed {
                name: name.to_string(),
            });
        }
        let request = Message::Request(RequestMessage {
            hash: format!("{name}_{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            data,
            fire_and_forget: true,
        });
        self.transport
            .send_message(target, domain.target_origin(), request)
            .await
            .map_err(|source| SendError::Transport {
                name: name.to_string(),
                source,
            })
    }

    /// Liveness of a pending request: a valid ack arrived for `hash`.
    pub fn is_acknowledged(&self, hash: &str) -> bool {
        self.listeners.is_acknowledged(hash)
    }

    fn cached_instance_id(&self, handle: &Handle) -> Option<String> {
        let mut ids = self
            .instance_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ids.retain(|_, (h, _)| !h.is_closed());
        ids.get(&handle.id()).map(|(_, id)| id.clone())
    }

    pub fn cached_instance_ids(&self) -> usize {
        self.instance_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn settle(name: &str, outcome: Outcome) -> Result<Response, SendError> {
    match outcome {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(error)) => Err(SendError::Remote {
            name: name.to_string(),
            error,
        }),
        Err(_) => Err(SendError::Dropped {
            name: name.to_string(),
        }),
    }
}

/// Asks the context behind a handle for its instance id; cached per handle.
#[async_trait]
impl InstanceIdentity for Requester {
    async fn instance_id(&self, handle: &Handle) -> Result<String, WindowError> {
        if let Some(id) = self.cached_instance_id(handle) {
            return Ok(id);
        }
        let response = self
            .send(
                handle,
                DomainPattern::Any,
                INSTANCE_ID_MESSAGE_NAME,
                None,
                self.defaults,
            )
            .await
            .map_err(|err| WindowError::Remote(err.to_string()))?;
        let id = response
            .data
            .as_str()
            .ok_or_else(|| WindowError::Remote("instance id is not a string".into()))?
            .to_string();
        let mut ids = self
            .instance_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (_, id) = ids
            .entry(handle.id())
            .or_insert_with(|| (handle.clone(), id));
        Ok(id.clone())
    }
}
