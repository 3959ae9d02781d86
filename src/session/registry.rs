use super::{SessionEvent, SessionHandle, SessionOwner};
use crate::error::{Result, TsError};
use lazy_static::lazy_static;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Weak;

lazy_static! {
    static ref GLOBAL: SessionRegistry = SessionRegistry::new();
}

/// Table from session handle to weakly held owner.
///
/// The only work done under the table lock is the lookup and the weak-to-strong
/// promotion; `notify` always runs after the lock is released, so owners may take
/// their own locks or unregister themselves from inside it.
pub struct SessionRegistry {
    entries: Mutex<HashMap<SessionHandle, Weak<dyn SessionOwner>>>,
}

impl SessionRegistry {
    /// A private table, independent of [`global`](Self::global).
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide table, created on first use and never torn down.
    pub fn global() -> &'static SessionRegistry {
        &GLOBAL
    }

    /// Maps `handle` to `owner`. Fails with `SessionExists` if the handle is taken.
    pub fn register(&self, handle: SessionHandle, owner: Weak<dyn SessionOwner>) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&handle) {
            drop(entries);
            warn!("register: {} is already registered", handle);
            return Err(TsError::SessionExists { handle: handle.0 });
        }
        entries.insert(handle, owner);
        Ok(())
    }

    /// Like [`register`](Self::register), unregistering when the guard drops.
    pub fn register_scoped(
        &self,
        handle: SessionHandle,
        owner: Weak<dyn SessionOwner>,
    ) -> Result<SessionRegistration<'_>> {
        self.register(handle, owner)?;
        Ok(SessionRegistration {
            registry: self,
            handle,
        })
    }

    /// Removes `handle`; returns false (and logs) when it was not registered.
    pub fn unregister(&self, handle: SessionHandle) -> bool {
        let removed = self.entries.lock().remove(&handle).is_some();
        if !removed {
            warn!("unregister: {} is not registered", handle);
        }
        removed
    }

    /// Delivers `event` to the owner of `handle` if it is registered and alive.
    ///
    /// Returns whether `notify` was called.
    pub fn dispatch(&self, handle: SessionHandle, event: &SessionEvent) -> bool {
        let owner = {
            let entries = self.entries.lock();
            match entries.get(&handle) {
                Some(weak) => weak.upgrade(),
                None => {
                    drop(entries);
                    debug!("dispatch: {} is not registered, dropping {:?}", handle, event);
                    return false;
                }
            }
        };

        match owner {
            Some(owner) => {
                owner.notify(event);
                true
            }
            None => {
                debug!("dispatch: owner of {} is gone, dropping {:?}", handle, event);
                false
            }
        }
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.entries.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries whose owner no longer exists; returns how many were removed.
    pub fn purge_dead(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, owner| owner.strong_count() > 0);
        before - entries.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

/// Keeps a session registered until dropped
#[must_use = "the session is unregistered when the registration is dropped"]
pub struct SessionRegistration<'a> {
    registry: &'a SessionRegistry,
    handle: SessionHandle,
}

impl SessionRegistration<'_> {
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }
}

impl Drop for SessionRegistration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.handle);
    }
}

impl std::fmt::Debug for SessionRegistration<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionRegistration").field(&self.handle).finish()
    }
}
