//! The extension seam: every lifecycle event the kernel emits, as an
//! ordered, fail-fast hook pipeline.
//!
//! An [`Extension`] implements whichever hooks it cares about; everything
//! else defaults to a no-op. Extensions carry a `priority` (default 100,
//! higher runs first; the sort is stable so equal priorities keep their
//! configured order) and run strictly sequentially for any given transport:
//! handler *n* begins only after handler *n-1* resolved. The first rejection
//! aborts the chain and surfaces the failing hook's name.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::ServerOptions;
use crate::context::{ConnectionConfiguration, Context, RequestInfo};
use crate::document::Document;
use crate::error::{HookChainError, HookError};
use crate::message::MessageKind;

/// Result of a plain hook handler.
pub type HookResult = Result<(), HookError>;

/// State returned by a load hook, applied to the freshly created document.
pub enum LoadedState {
    /// A fully materialized document; its state is encoded and applied.
    Doc(yrs::Doc),
    /// Raw Y-CRDT update bytes.
    Update(Vec<u8>),
}

/// A short-circuiting HTTP response produced by an `on_request` hook.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

// ==================== Payloads ====================

/// Handshake-scoped fields shared by the pre-attach hooks.
#[derive(Clone, Copy)]
pub struct TransportPayload<'a> {
    pub socket_id: Uuid,
    pub request: &'a RequestInfo,
    pub configuration: &'a ConnectionConfiguration,
    pub context: &'a Context,
}

#[derive(Clone, Copy)]
pub struct ConfigurePayload<'a> {
    pub options: &'a ServerOptions,
}

#[derive(Clone, Copy)]
pub struct ListenPayload {
    pub address: SocketAddr,
}

#[derive(Clone, Copy)]
pub struct RequestPayload<'a> {
    pub request: &'a RequestInfo,
}

#[derive(Clone, Copy)]
pub struct ConnectPayload<'a> {
    pub transport: TransportPayload<'a>,
    pub document_name: &'a str,
}

#[derive(Clone, Copy)]
pub struct AuthenticatePayload<'a> {
    pub transport: TransportPayload<'a>,
    pub document_name: &'a str,
    /// The opaque token read from the client's auth message.
    pub token: &'a str,
}

#[derive(Clone, Copy)]
pub struct LoadDocumentPayload<'a> {
    pub transport: TransportPayload<'a>,
    pub document_name: &'a str,
    /// The document being created; still marked as loading.
    pub document: &'a Arc<Document>,
}

#[derive(Clone, Copy)]
pub struct DocumentPayload<'a> {
    pub document_name: &'a str,
    pub document: &'a Arc<Document>,
    pub clients_count: usize,
    pub context: &'a Context,
}

#[derive(Clone, Copy)]
pub struct ConnectedPayload<'a> {
    pub transport: TransportPayload<'a>,
    pub document_name: &'a str,
    pub document: &'a Arc<Document>,
    pub clients_count: usize,
}

#[derive(Clone, Copy)]
pub struct MessagePayload<'a> {
    pub socket_id: Uuid,
    pub document_name: &'a str,
    pub document: &'a Arc<Document>,
    pub kind: MessageKind,
    pub context: &'a Context,
}

#[derive(Clone, Copy)]
pub struct StatelessPayload<'a> {
    pub document_name: &'a str,
    pub document: &'a Arc<Document>,
    /// The application payload string.
    pub payload: &'a str,
    /// Originating connection; `None` for server-initiated broadcasts.
    pub socket_id: Option<Uuid>,
    pub context: &'a Context,
}

#[derive(Clone, Copy)]
pub struct AwarenessPayload<'a> {
    pub document_name: &'a str,
    pub document: &'a Arc<Document>,
    /// Raw awareness payload as received.
    pub update: &'a [u8],
    pub socket_id: Uuid,
    pub context: &'a Context,
}

#[derive(Clone, Copy)]
pub struct ChangePayload<'a> {
    pub document_name: &'a str,
    pub document: &'a Arc<Document>,
    pub update: &'a [u8],
    /// Originating connection; `None` for programmatic updates, which are
    /// not persisted.
    pub origin: Option<Uuid>,
    pub clients_count: usize,
    pub context: &'a Context,
}

#[derive(Clone, Copy)]
pub struct StorePayload<'a> {
    pub document_name: &'a str,
    pub document: &'a Arc<Document>,
    /// Full document state encoded as a single update.
    pub state: &'a [u8],
    pub context: &'a Context,
}

#[derive(Clone, Copy)]
pub struct DisconnectPayload<'a> {
    pub socket_id: Uuid,
    pub document_name: &'a str,
    pub document: &'a Arc<Document>,
    pub clients_count: usize,
    pub context: &'a Context,
}

#[derive(Clone, Copy)]
pub struct DestroyPayload {}

// ==================== Extension Trait ====================

/// A named bundle of hook handlers.
#[async_trait]
pub trait Extension: Send + Sync + 'static {
    /// Name used in hook failure reports and logs.
    fn name(&self) -> &str {
        "extension"
    }

    /// Higher priorities run earlier. Default 100.
    fn priority(&self) -> i32 {
        100
    }

    /// Whether this extension performs authentication. The server demands
    /// an auth message before attach iff any configured extension returns
    /// true. (Trait objects cannot be probed for an overridden default
    /// method, so authenticating extensions must declare themselves.)
    fn authenticates(&self) -> bool {
        false
    }

    async fn on_configure(&self, _payload: ConfigurePayload<'_>) -> HookResult {
        Ok(())
    }

    async fn on_listen(&self, _payload: ListenPayload) -> HookResult {
        Ok(())
    }

    /// Non-upgrade HTTP request. Returning a response short-circuits the
    /// chain and answers the request.
    async fn on_request(&self, _payload: RequestPayload<'_>) -> Result<Option<HttpResponse>, HookError> {
        Ok(None)
    }

    /// Runs before the WebSocket upgrade; rejecting aborts the upgrade.
    async fn on_upgrade(&self, _payload: RequestPayload<'_>) -> HookResult {
        Ok(())
    }

    /// First message for a document name on a transport.
    async fn on_connect(&self, _payload: ConnectPayload<'_>) -> HookResult {
        Ok(())
    }

    /// Token check. Insert whatever the rest of the pipeline needs into
    /// `payload.transport.context`.
    async fn on_authenticate(&self, _payload: AuthenticatePayload<'_>) -> HookResult {
        Ok(())
    }

    /// Supply initial state for a document being created.
    async fn on_load_document(
        &self,
        _payload: LoadDocumentPayload<'_>,
    ) -> Result<Option<LoadedState>, HookError> {
        Ok(None)
    }

    async fn after_load_document(&self, _payload: DocumentPayload<'_>) -> HookResult {
        Ok(())
    }

    /// A connection finished attaching and its queued messages replayed.
    async fn connected(&self, _payload: ConnectedPayload<'_>) -> HookResult {
        Ok(())
    }

    /// Gate on every message an attached connection receives; rejecting
    /// aborts dispatch and closes the connection.
    async fn before_handle_message(&self, _payload: MessagePayload<'_>) -> HookResult {
        Ok(())
    }

    /// A stateless payload arrived from a connection.
    async fn on_stateless(&self, _payload: StatelessPayload<'_>) -> HookResult {
        Ok(())
    }

    /// Gate before a stateless payload fans out; rejecting suppresses the
    /// broadcast.
    async fn before_broadcast_stateless(&self, _payload: StatelessPayload<'_>) -> HookResult {
        Ok(())
    }

    async fn on_awareness_update(&self, _payload: AwarenessPayload<'_>) -> HookResult {
        Ok(())
    }

    /// A document changed. Failures are logged, never propagated.
    async fn on_change(&self, _payload: ChangePayload<'_>) -> HookResult {
        Ok(())
    }

    /// Persist the document. Failures without a message are swallowed;
    /// failures with a message are logged as errors.
    async fn on_store_document(&self, _payload: StorePayload<'_>) -> HookResult {
        Ok(())
    }

    async fn after_store_document(&self, _payload: StorePayload<'_>) -> HookResult {
        Ok(())
    }

    async fn on_disconnect(&self, _payload: DisconnectPayload<'_>) -> HookResult {
        Ok(())
    }

    async fn on_destroy(&self, _payload: DestroyPayload) -> HookResult {
        Ok(())
    }
}

// ==================== Chain ====================

/// Runs one hook across every extension in priority order, stopping at the
/// first rejection and naming the hook that failed.
macro_rules! run_hooks {
    ($chain:expr, $hook:ident, $payload:expr) => {{
        for extension in &$chain.extensions {
            extension.$hook($payload).await.map_err(|error| {
                HookChainError::new(stringify!($hook), extension.name(), error)
            })?;
        }
        Ok(())
    }};
}

/// The configured extension list, sorted once by descending priority.
pub struct ExtensionChain {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionChain {
    pub fn new(mut extensions: Vec<Arc<dyn Extension>>) -> Self {
        extensions.sort_by_key(|extension| std::cmp::Reverse(extension.priority()));
        Self { extensions }
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// True iff any configured extension authenticates.
    pub fn requires_authentication(&self) -> bool {
        self.extensions
            .iter()
            .any(|extension| extension.authenticates())
    }

    pub async fn on_configure(&self, payload: ConfigurePayload<'_>) -> Result<(), HookChainError> {
        run_hooks!(self, on_configure, payload)
    }

    pub async fn on_listen(&self, payload: ListenPayload) -> Result<(), HookChainError> {
        run_hooks!(self, on_listen, payload)
    }

    /// First extension returning a response wins; later hooks do not run.
    pub async fn on_request(
        &self,
        payload: RequestPayload<'_>,
    ) -> Result<Option<HttpResponse>, HookChainError> {
        for extension in &self.extensions {
            match extension.on_request(payload).await {
                Ok(Some(response)) => return Ok(Some(response)),
                Ok(None) => {}
                Err(error) => {
                    return Err(HookChainError::new("on_request", extension.name(), error))
                }
            }
        }
        Ok(None)
    }

    pub async fn on_upgrade(&self, payload: RequestPayload<'_>) -> Result<(), HookChainError> {
        run_hooks!(self, on_upgrade, payload)
    }

    pub async fn on_connect(&self, payload: ConnectPayload<'_>) -> Result<(), HookChainError> {
        run_hooks!(self, on_connect, payload)
    }

    pub async fn on_authenticate(
        &self,
        payload: AuthenticatePayload<'_>,
    ) -> Result<(), HookChainError> {
        run_hooks!(self, on_authenticate, payload)
    }

    /// Collects every extension's loaded state, in chain order.
    pub async fn on_load_document(
        &self,
        payload: LoadDocumentPayload<'_>,
    ) -> Result<Vec<LoadedState>, HookChainError> {
        let mut loaded = Vec::new();
        for extension in &self.extensions {
            match extension.on_load_document(payload).await {
                Ok(Some(state)) => loaded.push(state),
                Ok(None) => {}
                Err(error) => {
                    return Err(HookChainError::new(
                        "on_load_document",
                        extension.name(),
                        error,
                    ))
                }
            }
        }
        Ok(loaded)
    }

    pub async fn after_load_document(
        &self,
        payload: DocumentPayload<'_>,
    ) -> Result<(), HookChainError> {
        run_hooks!(self, after_load_document, payload)
    }

    pub async fn connected(&self, payload: ConnectedPayload<'_>) -> Result<(), HookChainError> {
        run_hooks!(self, connected, payload)
    }

    pub async fn before_handle_message(
        &self,
        payload: MessagePayload<'_>,
    ) -> Result<(), HookChainError> {
        run_hooks!(self, before_handle_message, payload)
    }

    pub async fn on_stateless(&self, payload: StatelessPayload<'_>) -> Result<(), HookChainError> {
        run_hooks!(self, on_stateless, payload)
    }

    pub async fn before_broadcast_stateless(
        &self,
        payload: StatelessPayload<'_>,
    ) -> Result<(), HookChainError> {
        run_hooks!(self, before_broadcast_stateless, payload)
    }

    pub async fn on_awareness_update(
        &self,
        payload: AwarenessPayload<'_>,
    ) -> Result<(), HookChainError> {
        run_hooks!(self, on_awareness_update, payload)
    }

    pub async fn on_change(&self, payload: ChangePayload<'_>) -> Result<(), HookChainError> {
        run_hooks!(self, on_change, payload)
    }

    pub async fn on_store_document(
        &self,
        payload: StorePayload<'_>,
    ) -> Result<(), HookChainError> {
        run_hooks!(self, on_store_document, payload)
    }

    pub async fn after_store_document(
        &self,
        payload: StorePayload<'_>,
    ) -> Result<(), HookChainError> {
        run_hooks!(self, after_store_document, payload)
    }

    pub async fn on_disconnect(
        &self,
        payload: DisconnectPayload<'_>,
    ) -> Result<(), HookChainError> {
        run_hooks!(self, on_disconnect, payload)
    }

    pub async fn on_destroy(&self, payload: DestroyPayload) -> Result<(), HookChainError> {
        run_hooks!(self, on_destroy, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        priority: i32,
        fail: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Extension for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn on_listen(&self, _payload: ListenPayload) -> HookResult {
            self.calls.lock().unwrap().push(self.name);
            if self.fail {
                return Err(HookError::denied("rejected"));
            }
            Ok(())
        }
    }

    struct Authenticator;

    #[async_trait]
    impl Extension for Authenticator {
        fn authenticates(&self) -> bool {
            true
        }
    }

    fn listen_payload() -> ListenPayload {
        ListenPayload {
            address: "127.0.0.1:0".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn runs_in_descending_priority_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = ExtensionChain::new(vec![
            Arc::new(Recording {
                name: "low",
                priority: 10,
                fail: false,
                calls: calls.clone(),
            }),
            Arc::new(Recording {
                name: "high",
                priority: 200,
                fail: false,
                calls: calls.clone(),
            }),
            Arc::new(Recording {
                name: "default",
                priority: 100,
                fail: false,
                calls: calls.clone(),
            }),
        ]);

        chain.on_listen(listen_payload()).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["high", "default", "low"]);
    }

    #[tokio::test]
    async fn equal_priorities_keep_configured_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = ExtensionChain::new(vec![
            Arc::new(Recording {
                name: "first",
                priority: 100,
                fail: false,
                calls: calls.clone(),
            }),
            Arc::new(Recording {
                name: "second",
                priority: 100,
                fail: false,
                calls: calls.clone(),
            }),
        ]);

        chain.on_listen(listen_payload()).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failure_short_circuits_and_names_the_hook() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = ExtensionChain::new(vec![
            Arc::new(Recording {
                name: "gate",
                priority: 200,
                fail: true,
                calls: calls.clone(),
            }),
            Arc::new(Recording {
                name: "never",
                priority: 100,
                fail: false,
                calls: calls.clone(),
            }),
        ]);

        let err = chain.on_listen(listen_payload()).await.unwrap_err();
        assert_eq!(err.hook, "on_listen");
        assert_eq!(err.extension, "gate");
        assert_eq!(*calls.lock().unwrap(), vec!["gate"]);
    }

    #[tokio::test]
    async fn authentication_requirement_detection() {
        let chain = ExtensionChain::new(vec![]);
        assert!(!chain.requires_authentication());

        let chain = ExtensionChain::new(vec![Arc::new(Authenticator) as Arc<dyn Extension>]);
        assert!(chain.requires_authentication());
    }
}
