//! # CAS session callbacks
//!
//! Hardware session providers call back on their own threads with nothing but the
//! opaque handle they allocated when the session was opened. [`SessionRegistry`] maps
//! that handle to the owning object without keeping it alive: the owner is held
//! weakly and promoted for the duration of one [`SessionOwner::notify`] call.
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use tsplane::session::{SessionEvent, SessionHandle, SessionOwner, SessionRegistry};
//!
//! struct Descrambler {
//!     seen: Mutex<Vec<SessionEvent>>,
//! }
//!
//! impl SessionOwner for Descrambler {
//!     fn notify(&self, event: &SessionEvent) {
//!         self.seen.lock().unwrap().push(event.clone());
//!     }
//! }
//!
//! # fn main() -> tsplane::Result<()> {
//! let registry = SessionRegistry::new();
//! let owner = Arc::new(Descrambler { seen: Mutex::new(Vec::new()) });
//! let handle = SessionHandle(0x5001);
//!
//! let registration = registry.register_scoped(handle, Arc::<Descrambler>::downgrade(&owner))?;
//! assert!(registry.dispatch(handle, &SessionEvent::Status(1)));
//! drop(registration);
//! assert!(!registry.dispatch(handle, &SessionEvent::Status(2)));
//! assert_eq!(owner.seen.lock().unwrap().len(), 1);
//! # Ok(())
//! # }
//! ```

mod registry;

pub use registry::{SessionRegistration, SessionRegistry};

use bytes::Bytes;
use std::fmt;

/// Opaque handle allocated by the session provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {:#x}", self.0)
    }
}

/// Asynchronous notification from a session provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Provider-defined status code
    Status(i32),
    /// Message payload, e.g. a CA system response
    Data(Bytes),
    Error { code: i32, message: String },
}

/// An object owning one provider session
pub trait SessionOwner: Send + Sync {
    /// Called outside every registry lock, on the provider's callback thread.
    fn notify(&self, event: &SessionEvent);
}
