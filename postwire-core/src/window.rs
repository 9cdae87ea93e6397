//! Live handles to remote execution contexts ("windows").

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use uuid::Uuid;

/// Host-provided surface of a live context. Implemented by the transport host
/// (a browser frame, a UDP peer address, an in-memory test double).
pub trait Window: Send + Sync + fmt::Debug {
    /// Confirmed closed or terminated.
    fn is_closed(&self) -> bool;

    fn close(&self) -> Result<(), WindowError>;

    fn focus(&self) -> Result<(), WindowError>;

    /// The caller has same-origin access to this context.
    fn is_same_domain(&self) -> bool;

    /// Navigate without adding a history entry. Hosts without such a primitive
    /// keep the default, which reports it as unsupported.
    fn replace_location(&self, _href: &str) -> Result<(), WindowError> {
        Err(WindowError::Unsupported {
            operation: "replace_location",
        })
    }

    /// Plain navigation.
    fn assign_location(&self, href: &str) -> Result<(), WindowError>;

    fn set_name(&self, name: &str) -> Result<(), WindowError>;

    /// Retarget the structural name attribute (e.g. the embedding frame
    /// element) if there is one. Returns whether one existed.
    fn set_frame_name(&self, _name: &str) -> Result<bool, WindowError> {
        Ok(false)
    }
}

/// Opaque identity token minted once per live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(Uuid);

impl HandleId {
    fn mint() -> Self {
        HandleId(Uuid::new_v4())
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live handle: a window plus its identity token. Clones share the token;
/// equality and hashing go through the token only.
#[derive(Clone)]
pub struct Handle {
    id: HandleId,
    window: Arc<dyn Window>,
}

impl Handle {
    pub fn new<W: Window + 'static>(window: W) -> Self {
        Self::from_arc(Arc::new(window))
    }

    pub fn from_arc(window: Arc<dyn Window>) -> Self {
        Self {
            id: HandleId::mint(),
            window,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn window(&self) -> &dyn Window {
        self.window.as_ref()
    }

    /// Terminated peers never receive replies.
    pub fn is_closed(&self) -> bool {
        self.window.is_closed()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("window", &self.window)
            .finish()
    }
}

/// Failure of a capability call on a window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("window is closed")]
    Closed,
    #[error("can not {operation} for window on different domain")]
    CrossDomain { operation: &'static str },
    #[error("{operation} is not supported by this window")]
    Unsupported { operation: &'static str },
    #[error("remote window call failed: {0}")]
    Remote(String),
    #[error("window operation failed: {0}")]
    Failed(String),
}
