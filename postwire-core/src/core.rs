//! Host-facing API: a `Peer` owns the registries for one context. The host
//! feeds it inbound messages and supplies the outbound transport.

use std::sync::{Arc, Weak};

use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use crate::capability::{MethodCall, RemoteCapability};
use crate::config::PeerConfig;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::domain::DomainPattern;
use crate::listeners::{
    handler, Handler, ListenOptions, ListenerError, ListenerHandle, Listeners, RequestContext,
    Response,
};
use crate::protocol::{Message, INSTANCE_ID_MESSAGE_NAME, METHOD_MESSAGE_NAME};
use crate::proxy::{ProxyRegistry, ProxyWindow, SerializedWindow, WindowDescriptor, WindowRef};
use crate::send::{Requester, SendError, SendOptions};
use crate::transport::Transport;
use crate::window::{Handle, WindowError};
use crate::wire::{self, DecodeError};

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// One protocol endpoint. Independent peers share nothing.
pub struct Peer {
    instance_id: String,
    config: PeerConfig,
    listeners: Arc<Listeners>,
    requester: Arc<Requester>,
    dispatcher: Dispatcher,
    proxies: Arc<ProxyRegistry>,
}

impl Peer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, PeerConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: PeerConfig) -> Self {
        let listeners = Listeners::new();
        let requester = Arc::new(Requester::new(
            listeners.clone(),
            transport.clone(),
            config.send_options(),
        ));
        let dispatcher = Dispatcher::new(listeners.clone(), transport);
        let proxies = Arc::new(ProxyRegistry::new(requester.clone()));
        let peer = Self {
            instance_id: Uuid::new_v4().to_string(),
            config,
            listeners,
            requester,
            dispatcher,
            proxies,
        };
        peer.register_builtins();
        peer
    }

    fn register_builtins(&self) {
        let instance_id = self.instance_id.clone();
        let identify = handler(move |_ctx| {
            let id = instance_id.clone();
            async move { Ok(Value::String(id)) }
        });
        // Weak: the proxy registry reaches these handlers through the requester.
        let proxies = Arc::downgrade(&self.proxies);
        let methods = handler(move |ctx| serve_method(proxies.clone(), ctx));

        let builtins: [(&str, Handler); 2] = [
            (INSTANCE_ID_MESSAGE_NAME, identify),
            (METHOD_MESSAGE_NAME, methods),
        ];
        for (name, handler) in builtins {
            if let Err(err) = self
                .listeners
                .add_request_listener(name, ListenOptions::default(), handler)
            {
                error!(name, error = %err, "failed to register built-in listener");
            }
        }
    }

    /// Token answered to `postwire_get_instance_id`.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Serve requests named `name`.
    pub fn on(
        &self,
        name: &str,
        options: ListenOptions,
        handler: Handler,
    ) -> Result<ListenerHandle, ListenerError> {
        self.listeners.add_request_listener(name, options, handler)
    }

    /// Request `name` from `target` with the configured timeouts.
    pub async fn send(
        &self,
        target: &Handle,
        domain: impl Into<DomainPattern>,
        name: &str,
        data: Option<Value>,
    ) -> Result<Response, SendError> {
        self.send_with(target, domain, name, data, self.requester.defaults())
            .await
    }

    pub async fn send_with(
        &self,
        target: &Handle,
        domain: impl Into<DomainPattern>,
        name: &str,
        data: Option<Value>,
        options: SendOptions,
    ) -> Result<Response, SendError> {
        self.requester
            .send(target, domain.into(), name, data, options)
            .await
    }

    pub async fn send_fire_and_forget(
        &self,
        target: &Handle,
        domain: impl Into<DomainPattern>,
        name: &str,
        data: Option<Value>,
    ) -> Result<(), SendError> {
        self.requester
            .send_fire_and_forget(target, &domain.into(), name, data)
            .await
    }

    /// Liveness of a pending request.
    pub fn is_acknowledged(&self, hash: &str) -> bool {
        self.requester.is_acknowledged(hash)
    }

    /// Handle one inbound message from `source`, whose origin the channel
    /// reported as `origin`.
    pub async fn receive(
        &self,
        source: &Handle,
        origin: &str,
        message: Message,
    ) -> Result<(), DispatchError> {
        self.dispatcher.dispatch(source, origin, message).await
    }

    /// Decode one wire payload, then [`receive`](Self::receive) it.
    pub async fn receive_bytes(
        &self,
        source: &Handle,
        origin: &str,
        bytes: &[u8],
    ) -> Result<(), ReceiveError> {
        let message = wire::decode_message(bytes, self.config.max_message_bytes)?;
        self.receive(source, origin, message).await?;
        Ok(())
    }

    pub fn proxies(&self) -> &ProxyRegistry {
        &self.proxies
    }

    /// Descriptor to put in a payload in place of `window`. Peers at `domain`
    /// may then call its capabilities through this peer.
    pub fn serialize_window(
        &self,
        window: impl Into<WindowRef>,
        domain: impl Into<DomainPattern>,
    ) -> WindowDescriptor {
        let stub = self.proxies.serialize(window);
        self.proxies.export(&stub.id, domain.into());
        stub.descriptor()
    }

    /// Proxy for a descriptor received from `source` at `origin`. Until it is
    /// bound, its capability calls are forwarded to `source`.
    pub fn deserialize_window(
        &self,
        source: &Handle,
        origin: &str,
        descriptor: &WindowDescriptor,
    ) -> ProxyWindow {
        let capability = RemoteCapability::new(
            descriptor.id.clone(),
            source.clone(),
            DomainPattern::from(origin),
            self.requester.clone(),
        );
        self.proxies.from_stub(SerializedWindow {
            id: descriptor.id.clone(),
            capability: Arc::new(capability),
        })
    }

    pub async fn match_window(
        &self,
        proxy: &ProxyWindow,
        candidate: &Handle,
    ) -> Result<bool, WindowError> {
        self.proxies.match_window(proxy, candidate).await
    }
}

fn error_payload(message: impl ToString) -> Value {
    json!({ "message": message.to_string() })
}

async fn serve_method(proxies: Weak<ProxyRegistry>, ctx: RequestContext) -> Result<Value, Value> {
    let call: MethodCall =
        serde_json::from_value(ctx.data.unwrap_or(Value::Null)).map_err(error_payload)?;
    let proxies = proxies
        .upgrade()
        .ok_or_else(|| error_payload("peer is gone"))?;
    let (proxy, domain) = proxies
        .exported(&call.id)
        .ok_or_else(|| error_payload(format!("window {} is not exported", call.id)))?;
    if !domain.matches(&ctx.origin) {
        return Err(error_payload(format!(
            "Request origin {} does not match domain {}",
            ctx.origin, domain
        )));
    }
    proxy.call(&call).await.map_err(error_payload)
}
