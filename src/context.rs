//! Per-transport state shared with extensions.
//!
//! [`Context`] is a typed map that authentication and connect hooks fill in
//! and later hooks read back. [`ConnectionConfiguration`] carries the
//! handshake flags hooks are allowed to flip before a connection attaches.
//! [`CloseReason`] is the close-frame vocabulary.

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::error::HookError;

// ==================== Context ====================

/// Typed per-transport context, built up by hooks during the handshake.
///
/// Values are keyed by type: an authentication extension inserts its user
/// record, and any later hook on the same transport can read it back with
/// [`Context::get`]. Never shared across transports.
#[derive(Default)]
pub struct Context {
    values: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl Context {
    /// Insert a value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&self, value: T) {
        self.values
            .write()
            .expect("context lock poisoned")
            .insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Clone out a value of the given type, if present.
    pub fn get<T: Any + Clone + Send + Sync>(&self) -> Option<T> {
        self.values
            .read()
            .expect("context lock poisoned")
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    /// Whether a value of the given type is present.
    pub fn contains<T: Any>(&self) -> bool {
        self.values
            .read()
            .expect("context lock poisoned")
            .contains_key(&TypeId::of::<T>())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.values.read().expect("context lock poisoned").len();
        f.debug_struct("Context").field("values", &len).finish()
    }
}

// ==================== Connection Configuration ====================

/// Handshake-scoped connection flags.
///
/// Hooks may flip these through a shared reference while the handshake is in
/// flight; after attach the connection snapshots `read_only` and the record
/// is semantically frozen.
#[derive(Debug)]
pub struct ConnectionConfiguration {
    read_only: AtomicBool,
    requires_authentication: AtomicBool,
    is_authenticated: AtomicBool,
}

impl ConnectionConfiguration {
    pub fn new(requires_authentication: bool) -> Self {
        Self {
            read_only: AtomicBool::new(false),
            requires_authentication: AtomicBool::new(requires_authentication),
            is_authenticated: AtomicBool::new(false),
        }
    }

    pub fn read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn requires_authentication(&self) -> bool {
        self.requires_authentication.load(Ordering::SeqCst)
    }

    pub fn set_requires_authentication(&self, required: bool) {
        self.requires_authentication.store(required, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.is_authenticated.store(authenticated, Ordering::SeqCst);
    }
}

// ==================== Request Info ====================

/// The HTTP request a transport arrived with: path, headers, query.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

// ==================== Close Reasons ====================

/// WebSocket close codes accepted by the application range.
const VALID_CLOSE_CODES: std::ops::RangeInclusive<u16> = 1000..=4999;

/// A close frame: code plus human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: Cow<'static, str>,
}

/// Clean shutdown requested by the peer or the protocol.
pub const NORMAL_CLOSURE: CloseReason = CloseReason {
    code: 1000,
    reason: Cow::Borrowed("Normal Closure"),
};

/// Server-initiated teardown; the client should reconnect.
pub const RESET_CONNECTION: CloseReason = CloseReason {
    code: 4205,
    reason: Cow::Borrowed("Reset Connection"),
};

/// The transport never authenticated or spoke the protocol.
pub const UNAUTHORIZED: CloseReason = CloseReason {
    code: 4401,
    reason: Cow::Borrowed("Unauthorized"),
};

/// A hook rejected the transport.
pub const FORBIDDEN: CloseReason = CloseReason {
    code: 4403,
    reason: Cow::Borrowed("Forbidden"),
};

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Build a close reason from a hook rejection.
    ///
    /// Codes outside the transport's valid range fall back to the given
    /// reason (typically [`FORBIDDEN`]).
    pub fn from_hook_error(error: &HookError, fallback: CloseReason) -> Self {
        let code = match error.code {
            Some(code) if VALID_CLOSE_CODES.contains(&code) => code,
            _ => return fallback,
        };
        let reason = error
            .reason
            .clone()
            .map(Cow::Owned)
            .unwrap_or(fallback.reason);
        Self { code, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct User {
        id: String,
    }

    #[test]
    fn context_insert_and_get() {
        let ctx = Context::default();
        assert!(ctx.get::<User>().is_none());
        ctx.insert(User { id: "u1".into() });
        assert_eq!(ctx.get::<User>(), Some(User { id: "u1".into() }));
        assert!(ctx.contains::<User>());
    }

    #[test]
    fn context_replaces_same_type() {
        let ctx = Context::default();
        ctx.insert(User { id: "first".into() });
        ctx.insert(User { id: "second".into() });
        assert_eq!(ctx.get::<User>().unwrap().id, "second");
    }

    #[test]
    fn configuration_flags() {
        let config = ConnectionConfiguration::new(true);
        assert!(config.requires_authentication());
        assert!(!config.is_authenticated());
        assert!(!config.read_only());
        config.set_authenticated(true);
        config.set_read_only(true);
        assert!(config.is_authenticated());
        assert!(config.read_only());
    }

    #[test]
    fn hook_error_close_code_passes_through() {
        let err = HookError::denied("not yours").with_code(4100);
        let reason = CloseReason::from_hook_error(&err, FORBIDDEN);
        assert_eq!(reason.code, 4100);
        assert_eq!(reason.reason, "not yours");
    }

    #[test]
    fn invalid_close_code_falls_back_to_forbidden() {
        let err = HookError::denied("nope").with_code(99);
        assert_eq!(CloseReason::from_hook_error(&err, FORBIDDEN), FORBIDDEN);
        let err = HookError::denied("nope");
        assert_eq!(CloseReason::from_hook_error(&err, FORBIDDEN), FORBIDDEN);
    }
}
