//! Window capabilities: the call surface shared by bound and unbound proxies.
//!
//! A bound proxy acts on its live handle through [`LocalCapability`]; an
//! unbound one forwards each call to the peer that exported it through
//! [`RemoteCapability`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::DomainPattern;
use crate::protocol::METHOD_MESSAGE_NAME;
use crate::proxy::ProxyId;
use crate::send::{Requester, SendError};
use crate::window::{Handle, WindowError};

/// Resolves the instance id of the context behind a live handle. Stable for
/// the lifetime of that context.
#[async_trait]
pub trait InstanceIdentity: Send + Sync {
    async fn instance_id(&self, handle: &Handle) -> Result<String, WindowError>;
}

#[async_trait]
pub trait WindowCapability: Send + Sync + fmt::Debug {
    async fn close(&self) -> Result<(), WindowError>;
    async fn focus(&self) -> Result<(), WindowError>;
    async fn is_closed(&self) -> Result<bool, WindowError>;
    async fn set_location(&self, href: &str) -> Result<(), WindowError>;
    async fn set_name(&self, name: &str) -> Result<(), WindowError>;
    async fn instance_id(&self) -> Result<String, WindowError>;
}

/// Capability method names as they travel in a `postwire_method` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowMethod {
    #[serde(rename = "close")]
    Close,
    #[serde(rename = "focus")]
    Focus,
    #[serde(rename = "isClosed")]
    IsClosed,
    #[serde(rename = "setLocation")]
    SetLocation,
    #[serde(rename = "setName")]
    SetName,
    #[serde(rename = "getInstanceID")]
    InstanceId,
}

/// Payload of a `postwire_method` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub id: ProxyId,
    pub name: WindowMethod,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl MethodCall {
    /// First argument as a string, for `setLocation` / `setName`.
    pub fn str_arg(&self) -> Result<&str, WindowError> {
        self.args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| {
                WindowError::Failed(format!("{:?} expects a string argument", self.name))
            })
    }
}

/// Acts directly on a live handle.
#[derive(Clone)]
pub struct LocalCapability {
    handle: Handle,
    ids: Arc<dyn InstanceIdentity>,
}

impl LocalCapability {
    pub fn new(handle: Handle, ids: Arc<dyn InstanceIdentity>) -> Self {
        Self { handle, ids }
    }
}

impl fmt::Debug for LocalCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCapability")
            .field("handle", &self.handle.id())
            .finish()
    }
}

#[async_trait]
impl WindowCapability for LocalCapability {
    async fn close(&self) -> Result<(), WindowError> {
        self.handle.window().close()
    }

    async fn focus(&self) -> Result<(), WindowError> {
        self.handle.window().focus()
    }

    async fn is_closed(&self) -> Result<bool, WindowError> {
        Ok(self.handle.is_closed())
    }

    /// Prefers navigation that leaves no history entry; falls back to a plain
    /// assignment when that is unavailable or fails.
    async fn set_location(&self, href: &str) -> Result<(), WindowError> {
        let window = self.handle.window();
        if window.is_same_domain() {
            match window.replace_location(href) {
                Ok(()) => return Ok(()),
                Err(err) => debug!(
                    handle = %self.handle.id(),
                    error = %err,
                    "replace failed, assigning location"
                ),
            }
        }
        window.assign_location(href)
    }

    async fn set_name(&self, name: &str) -> Result<(), WindowError> {
        let window = self.handle.window();
        if !window.is_same_domain() {
            return Err(WindowError::CrossDomain {
                operation: "set name",
            });
        }
        window.set_name(name)?;
        window.set_frame_name(name)?;
        Ok(())
    }

    async fn instance_id(&self) -> Result<String, WindowError> {
        self.ids.instance_id(&self.handle).await
    }
}

/// Forwards each call to the peer that exported window `id`.
pub struct RemoteCapability {
    id: ProxyId,
    target: Handle,
    domain: DomainPattern,
    requester: Arc<Requester>,
}

impl RemoteCapability {
    /// `target` is the peer that sent the descriptor; `domain` is its origin.
    pub fn new(
        id: ProxyId,
        target: Handle,
        domain: DomainPattern,
        requester: Arc<Requester>,
    ) -> Self {
        Self {
            id,
            target,
            domain,
            requester,
        }
    }

    async fn call(&self, name: WindowMethod, args: Vec<Value>) -> Result<Value, WindowError> {
        let call = MethodCall {
            id: self.id.clone(),
            name,
            args,
        };
        let data = serde_json::to_value(&call).map_err(|e| WindowError::Failed(e.to_string()))?;
        self.requester
            .send(
                &self.target,
                self.domain.clone(),
                METHOD_MESSAGE_NAME,
                Some(data),
                self.requester.defaults(),
            )
            .await
            .map(|response| response.data)
            .map_err(remote_error)
    }
}

impl fmt::Debug for RemoteCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCapability")
            .field("id", &self.id)
            .field("target", &self.target.id())
            .field("domain", &self.domain)
            .finish()
    }
}

fn remote_error(err: SendError) -> WindowError {
    match err {
        SendError::WindowClosed { .. } => WindowError::Closed,
        SendError::Remote { error, .. } => match error.get("message").and_then(Value::as_str) {
            Some(message) => WindowError::Remote(message.to_string()),
            None => WindowError::Remote(error.to_string()),
        },
        other => WindowError::Remote(other.to_string()),
    }
}

#[async_trait]
impl WindowCapability for RemoteCapability {
    async fn close(&self) -> Result<(), WindowError> {
        self.call(WindowMethod::Close, Vec::new()).await.map(drop)
    }

    async fn focus(&self) -> Result<(), WindowError> {
        self.call(WindowMethod::Focus, Vec::new()).await.map(drop)
    }

    async fn is_closed(&self) -> Result<bool, WindowError> {
        self.call(WindowMethod::IsClosed, Vec::new())
            .await?
            .as_bool()
            .ok_or_else(|| WindowError::Remote("isClosed did not return a boolean".into()))
    }

    async fn set_location(&self, href: &str) -> Result<(), WindowError> {
        self.call(WindowMethod::SetLocation, vec![json!(href)])
            .await
            .map(drop)
    }

    async fn set_name(&self, name: &str) -> Result<(), WindowError> {
        self.call(WindowMethod::SetName, vec![json!(name)])
            .await
            .map(drop)
    }

    async fn instance_id(&self) -> Result<String, WindowError> {
        match self.call(WindowMethod::InstanceId, Vec::new()).await? {
            Value::String(id) => Ok(id),
            other => Err(WindowError::Remote(format!(
                "getInstanceID returned {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryWindow;
    use crate::window::Window;

    struct FixedIds;

    #[async_trait]
    impl InstanceIdentity for FixedIds {
        async fn instance_id(&self, handle: &Handle) -> Result<String, WindowError> {
            Ok(format!("ctx-{}", handle.id()))
        }
    }

    fn local(win: &Arc<MemoryWindow>) -> (LocalCapability, Handle) {
        let handle = Handle::from_arc(win.clone());
        (LocalCapability::new(handle.clone(), Arc::new(FixedIds)), handle)
    }

    #[tokio::test]
    async fn set_location_replaces_on_same_domain() {
        let win = Arc::new(MemoryWindow::new("https://a.example"));
        let (cap, _) = local(&win);
        cap.set_location("https://a.example/one").await.unwrap();
        cap.set_location("https://a.example/two").await.unwrap();
        assert_eq!(win.history_len(), 1);
        assert_eq!(win.location().as_deref(), Some("https://a.example/two"));
    }

    #[tokio::test]
    async fn set_location_falls_back_to_assign() {
        let win = Arc::new(MemoryWindow::new("https://a.example").without_replace());
        let (cap, _) = local(&win);
        cap.set_location("https://a.example/one").await.unwrap();
        cap.set_location("https://a.example/two").await.unwrap();
        assert_eq!(win.history_len(), 2);

        let foreign = Arc::new(MemoryWindow::new("https://b.example").cross_domain());
        let (cap, _) = local(&foreign);
        cap.set_location("https://b.example/one").await.unwrap();
        cap.set_location("https://b.example/two").await.unwrap();
        assert_eq!(foreign.history_len(), 2);
    }

    #[tokio::test]
    async fn set_name_requires_same_domain() {
        let foreign = Arc::new(MemoryWindow::new("https://b.example").cross_domain());
        let (cap, _) = local(&foreign);
        assert_eq!(
            cap.set_name("child").await.unwrap_err(),
            WindowError::CrossDomain {
                operation: "set name"
            }
        );
        assert_eq!(foreign.name(), "");
    }

    #[tokio::test]
    async fn set_name_retargets_frame() {
        let framed = Arc::new(MemoryWindow::new("https://a.example").in_frame());
        let (cap, _) = local(&framed);
        cap.set_name("child").await.unwrap();
        assert_eq!(framed.name(), "child");
        assert_eq!(framed.frame_name().as_deref(), Some("child"));
    }

    #[tokio::test]
    async fn close_focus_and_identity() {
        let win = Arc::new(MemoryWindow::new("https://a.example"));
        let (cap, handle) = local(&win);
        cap.focus().await.unwrap();
        assert_eq!(win.focus_count(), 1);
        assert_eq!(cap.instance_id().await.unwrap(), format!("ctx-{}", handle.id()));
        assert!(!cap.is_closed().await.unwrap());
        cap.close().await.unwrap();
        assert!(win.is_closed());
        assert!(cap.is_closed().await.unwrap());
        assert_eq!(cap.focus().await.unwrap_err(), WindowError::Closed);
    }

    #[test]
    fn method_call_wire_shape() {
        let call = MethodCall {
            id: ProxyId::from("w1"),
            name: WindowMethod::SetLocation,
            args: vec![json!("https://x.example")],
        };
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({ "id": "w1", "name": "setLocation", "args": ["https://x.example"] })
        );
        assert_eq!(call.str_arg().unwrap(), "https://x.example");
        let bare: MethodCall =
            serde_json::from_value(json!({ "id": "w1", "name": "getInstanceID" })).unwrap();
        assert!(bare.args.is_empty());
        assert!(bare.str_arg().is_err());
    }

    #[test]
    fn remote_errors_keep_message() {
        let err = remote_error(SendError::Remote {
            name: METHOD_MESSAGE_NAME.into(),
            error: json!({ "message": "window is closed" }),
        });
        assert_eq!(err, WindowError::Remote("window is closed".into()));
        let err = remote_error(SendError::Remote {
            name: METHOD_MESSAGE_NAME.into(),
            error: json!("no_handler"),
        });
        assert_eq!(err, WindowError::Remote("\"no_handler\"".into()));
    }
}
