//! Message dispatch: drives the request / ack / response exchange for one
//! inbound message.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::domain::DomainPattern;
use crate::listeners::{Listeners, RequestContext, RequestListener, Response, ResponseListener};
use crate::protocol::{
    log_name, AckMessage, Message, RequestMessage, ResponseAck, ResponseMessage, NO_HANDLER,
};
use crate::transport::{Transport, TransportError};
use crate::window::Handle;

/// Which reply an authentication failure was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Ack,
    Response,
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyKind::Ack => f.write_str("Ack"),
            ReplyKind::Response => f.write_str("Response"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Reply came from an origin the pending request does not accept.
    #[error("{kind} origin {origin} does not match domain {domain}")]
    OriginMismatch {
        kind: ReplyKind,
        origin: String,
        domain: String,
    },
    /// Reply came from a handle other than the one the request was sent to.
    #[error("{kind} source does not match registered window")]
    SourceMismatch { kind: ReplyKind },
    /// Sending the ack or response for a request failed.
    #[error("failed to send reply for {name}: {source}")]
    Send {
        name: String,
        #[source]
        source: TransportError,
    },
}

impl DispatchError {
    /// Authentication failures are security relevant and never swallowed.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            DispatchError::OriginMismatch { .. } | DispatchError::SourceMismatch { .. }
        )
    }
}

/// Receiving side of the protocol. Holds the injected registry and transport.
pub struct Dispatcher {
    listeners: Arc<Listeners>,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(listeners: Arc<Listeners>, transport: Arc<dyn Transport>) -> Self {
        Self {
            listeners,
            transport,
        }
    }

    /// Process one inbound message from `source`, whose origin the channel
    /// reported as `origin`.
    pub async fn dispatch(
        &self,
        source: &Handle,
        origin: &str,
        message: Message,
    ) -> Result<(), DispatchError> {
        match message {
            Message::Request(request) => self.on_request(source, origin, request).await,
            Message::Ack(ack) => self.on_ack(source, origin, &ack),
            Message::Response(response) => self.on_response(source, origin, response),
        }
    }

    async fn on_request(
        &self,
        source: &Handle,
        origin: &str,
        request: RequestMessage,
    ) -> Result<(), DispatchError> {
        let listener = self
            .listeners
            .request_listener(&request.name, source, origin);
        let name = log_name(&request.name, request.data.as_ref());
        debug!(name = %name, origin, data = ?request.data, "receive::req");

        // The ack is on the wire before the handler starts, even when the
        // transport suspends. A failed ack does not stop the handler.
        let ack = Message::Ack(AckMessage {
            hash: request.hash.clone(),
            name: request.name.clone(),
        });
        let ack_sent = self.send_reply(source, origin, &request, ack).await;

        let data = request.data.clone();
        let outcome = run_handler(listener.as_ref(), source, origin, data).await;
        match &outcome {
            Ok(data) => debug!(name = %name, origin, data = ?data, "respond::res"),
            Err(err) => warn!(name = %name, origin, error = ?err, "respond::err"),
        }
        let reply = Message::Response(ResponseMessage::from_outcome(&request, outcome));
        let response_sent = self.send_reply(source, origin, &request, reply).await;

        let Err(err) = ack_sent.and(response_sent) else {
            return Ok(());
        };
        match listener.and_then(|l| l.handle_error) {
            Some(handle_error) => {
                handle_error(err);
                Ok(())
            }
            None => {
                error!(name = %name, origin, error = %err, "unhandled dispatch error");
                Err(err)
            }
        }
    }

    async fn send_reply(
        &self,
        source: &Handle,
        origin: &str,
        request: &RequestMessage,
        reply: Message,
    ) -> Result<(), DispatchError> {
        if request.fire_and_forget || source.is_closed() {
            return Ok(());
        }
        self.transport
            .send_message(source, origin, reply)
            .await
            .map_err(|source| DispatchError::Send {
                name: request.name.clone(),
                source,
            })
    }

    fn on_ack(&self, source: &Handle, origin: &str, ack: &AckMessage) -> Result<(), DispatchError> {
        let verified = self.listeners.with_response_listener(
            &ack.hash,
            |listener| -> Result<(), DispatchError> {
                verify_reply(listener, source, origin, ReplyKind::Ack)?;
                listener.acknowledge();
                Ok(())
            },
        );
        match verified {
            Some(result) => result,
            // Already resolved, errored, or never ours.
            None => Ok(()),
        }
    }

    fn on_response(
        &self,
        source: &Handle,
        origin: &str,
        response: ResponseMessage,
    ) -> Result<(), DispatchError> {
        let listener = self.listeners.take_response_listener(&response.hash, |listener| {
            verify_reply(listener, source, origin, ReplyKind::Response)
        })?;
        let Some(listener) = listener else {
            return Ok(());
        };

        let name = log_name(&response.name, response.data.as_ref());
        let outcome = match response.ack {
            ResponseAck::Success => {
                debug!(name = %name, origin, data = ?response.data, "receive::res");
                Ok(Response {
                    source: source.clone(),
                    origin: origin.to_string(),
                    data: response.data.unwrap_or(Value::Null),
                })
            }
            ResponseAck::Error => {
                warn!(name = %name, origin, error = ?response.error, "receive::err");
                Err(response.error.unwrap_or(Value::Null))
            }
        };
        // The requester may have stopped waiting; nothing left to do then.
        let _ = listener.resolver.send(outcome);
        Ok(())
    }
}

fn verify_reply(
    listener: &ResponseListener,
    source: &Handle,
    origin: &str,
    kind: ReplyKind,
) -> Result<(), DispatchError> {
    if !listener.domain.matches(origin) {
        warn!(%kind, origin, domain = %listener.domain, "reply from unexpected origin");
        return Err(DispatchError::OriginMismatch {
            kind,
            origin: origin.to_string(),
            domain: listener.domain.to_string(),
        });
    }
    if *source != listener.window {
        warn!(%kind, origin, "reply from unexpected source");
        return Err(DispatchError::SourceMismatch { kind });
    }
    Ok(())
}

async fn run_handler(
    listener: Option<&RequestListener>,
    source: &Handle,
    origin: &str,
    data: Option<Value>,
) -> Result<Value, Value> {
    let Some(listener) = listener else {
        return Err(Value::String(NO_HANDLER.to_string()));
    };
    if !listener.domain.matches(origin) {
        warn!(
            name = %listener.name,
            origin,
            domain = %listener.domain,
            "request from unexpected origin"
        );
        return Err(domain_mismatch(origin, &listener.domain));
    }
    (listener.handler)(RequestContext {
        source: source.clone(),
        origin: origin.to_string(),
        data,
    })
    .await
}

fn domain_mismatch(origin: &str, domain: &DomainPattern) -> Value {
    json!({ "message": format!("Request origin {origin} does not match domain {domain}") })
}
