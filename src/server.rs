//! The server kernel.
//!
//! Accepts transports, drives the per-transport handshake state machine
//! (queue → connect → authenticate → attach → replay), owns the document
//! registry (at most one live instance per name), runs the extension
//! pipeline, and schedules debounced persistence. One task per transport
//! processes inbound messages strictly in receive order, so the hook chain
//! for a transport is serialized by construction.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerOptions;
use crate::connection::{CloseEvent, Connection, TransportCommand};
use crate::context::{
    CloseReason, ConnectionConfiguration, Context, RequestInfo, FORBIDDEN, NORMAL_CLOSURE,
    RESET_CONNECTION, UNAUTHORIZED,
};
use crate::debounce::Debouncer;
use crate::document::{Document, LoadState, Peer, UpdateEvent};
use crate::error::{HookChainError, HookError};
use crate::extension::{
    AuthenticatePayload, ChangePayload, ConfigurePayload, ConnectPayload, ConnectedPayload,
    DestroyPayload, DisconnectPayload, DocumentPayload, Extension, ExtensionChain,
    LoadDocumentPayload, LoadedState, ListenPayload, RequestPayload, StatelessPayload,
    StorePayload, TransportPayload,
};
use crate::message::{self, MessageKind};
use crate::trace_log::{Direction, TraceLog};

/// Registry and connection totals.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ServerStats {
    pub documents: usize,
    pub connections: usize,
}

fn store_key(document_name: &str) -> String {
    format!("store:{document_name}")
}

fn status_from_hook(error: &HookError, fallback: StatusCode) -> StatusCode {
    error
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(fallback)
}

// ==================== Server ====================

/// The collaborative document server.
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Cloneable handle for embedding the server into other components.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    weak_self: Weak<ServerInner>,
    options: ServerOptions,
    chain: ExtensionChain,
    documents: RwLock<HashMap<String, Arc<Document>>>,
    debouncer: Debouncer,
    trace: Arc<TraceLog>,
    configured: AtomicBool,
    destroyed: AtomicBool,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self::with_extensions(options, Vec::new())
    }

    pub fn with_extensions(options: ServerOptions, extensions: Vec<Arc<dyn Extension>>) -> Self {
        let verbose = std::env::var_os("CHORUS_TRACE").is_some();
        let inner = Arc::new_cyclic(|weak_self| ServerInner {
            weak_self: weak_self.clone(),
            chain: ExtensionChain::new(extensions),
            debouncer: Debouncer::new(options.debounce, options.max_debounce),
            trace: Arc::new(TraceLog::new(TraceLog::DEFAULT_CAPACITY, verbose)),
            documents: RwLock::new(HashMap::new()),
            configured: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            options,
        });
        Self { inner }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Run the `on_configure` hooks. Idempotent; called once before serving.
    pub async fn configure(&self) -> Result<(), HookChainError> {
        if self.inner.configured.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .chain
            .on_configure(ConfigurePayload {
                options: &self.inner.options,
            })
            .await
    }

    /// Print the startup banner and run the `on_listen` hooks.
    pub async fn started(&self, address: SocketAddr) -> Result<(), HookChainError> {
        if !self.inner.options.quiet && std::env::var_os("CHORUS_QUIET").is_none() {
            info!(
                "{} listening on {}",
                self.inner.options.display_name(),
                address
            );
        }
        self.inner.chain.on_listen(ListenPayload { address }).await
    }

    /// Router with the WebSocket endpoint at `/`. Upgrades are accepted on
    /// every path; non-upgrade requests run the `on_request` hooks.
    pub fn router(&self) -> Router {
        self.router_at("/")
    }

    /// Router with the WebSocket endpoint at the given path.
    pub fn router_at(&self, path: &str) -> Router {
        Router::new()
            .route(path, any(endpoint))
            .fallback(endpoint)
            .with_state(Arc::clone(&self.inner))
    }

    /// Close every client, flush the trace log, run the `on_destroy` hooks.
    /// Already-scheduled store debounces still run; no new ones start.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let documents: Vec<Arc<Document>> = {
            let registry = self.inner.documents.read().await;
            registry.values().cloned().collect()
        };
        for document in documents {
            document.broadcast_close(RESET_CONNECTION).await;
        }
        self.inner.trace.flush();
        if let Err(err) = self.inner.chain.on_destroy(DestroyPayload {}).await {
            warn!("destroy hook failed: {err}");
        }
    }
}

impl ServerHandle {
    pub async fn documents_count(&self) -> usize {
        self.inner.documents.read().await.len()
    }

    pub async fn connections_count(&self) -> usize {
        self.stats().await.connections
    }

    pub async fn stats(&self) -> ServerStats {
        let documents = self.inner.documents.read().await;
        ServerStats {
            documents: documents.len(),
            connections: documents
                .values()
                .map(|document| document.connections_count())
                .sum(),
        }
    }

    pub async fn get_document(&self, document_name: &str) -> Option<Arc<Document>> {
        self.inner.documents.read().await.get(document_name).cloned()
    }

    /// Close every connection on one document, or on all documents.
    pub async fn close_connections(&self, document_name: Option<&str>) {
        let targets: Vec<Arc<Document>> = {
            let documents = self.inner.documents.read().await;
            match document_name {
                Some(name) => documents.get(name).cloned().into_iter().collect(),
                None => documents.values().cloned().collect(),
            }
        };
        for document in targets {
            document.broadcast_close(RESET_CONNECTION).await;
        }
    }

    /// Server-initiated stateless push to every connection on a document,
    /// through the same broadcast gate client broadcasts pass.
    pub async fn broadcast_stateless(
        &self,
        document_name: &str,
        payload: &str,
    ) -> Result<(), HookChainError> {
        let Some(document) = self.get_document(document_name).await else {
            return Ok(());
        };
        let context = Context::default();
        let hook_payload = StatelessPayload {
            document_name,
            document: &document,
            payload,
            socket_id: None,
            context: &context,
        };
        self.inner.chain.before_broadcast_stateless(hook_payload).await?;
        document.broadcast_stateless(payload, None).await;
        Ok(())
    }

    /// The message trace log.
    pub fn trace_log(&self) -> Arc<TraceLog> {
        Arc::clone(&self.inner.trace)
    }
}

// ==================== HTTP Endpoint ====================

async fn endpoint(
    State(inner): State<Arc<ServerInner>>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let request = RequestInfo {
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect(),
        query,
    };

    match ws {
        Ok(upgrade) => {
            let payload = RequestPayload { request: &request };
            if let Err(err) = inner.chain.on_upgrade(payload).await {
                warn!("upgrade rejected: {err}");
                let status = status_from_hook(&err.error, StatusCode::FORBIDDEN);
                let body = err.error.reason.clone().unwrap_or_default();
                return (status, body).into_response();
            }
            upgrade
                .on_upgrade(move |socket| handle_socket(inner, socket, request))
                .into_response()
        }
        Err(_) => handle_request(inner, request).await,
    }
}

async fn handle_request(inner: Arc<ServerInner>, request: RequestInfo) -> Response {
    let payload = RequestPayload { request: &request };
    match inner.chain.on_request(payload).await {
        Ok(Some(response)) => {
            let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
            (status, response.body).into_response()
        }
        Ok(None) => (StatusCode::OK, "OK").into_response(),
        Err(err) => {
            warn!("request hook failed: {err}");
            let status = status_from_hook(&err.error, StatusCode::INTERNAL_SERVER_ERROR);
            let body = err.error.reason.clone().unwrap_or_default();
            (status, body).into_response()
        }
    }
}

// ==================== Transport Task ====================

/// Per-transport handshake state. Each document name on the transport keeps
/// its own queue/establishing/attached sub-state.
struct TransportSession {
    socket_id: Uuid,
    request: RequestInfo,
    configuration: Arc<ConnectionConfiguration>,
    context: Arc<Context>,
    outbound: mpsc::UnboundedSender<TransportCommand>,
    queued: HashMap<String, Vec<message::IncomingFrame>>,
    establishing: HashSet<String>,
    attached: HashMap<String, Arc<Connection>>,
}

impl TransportSession {
    fn transport_payload(&self) -> TransportPayload<'_> {
        TransportPayload {
            socket_id: self.socket_id,
            request: &self.request,
            configuration: &self.configuration,
            context: &self.context,
        }
    }

    fn send(&self, frame: Vec<u8>) {
        let _ = self.outbound.send(TransportCommand::Send(frame));
    }

    fn close(&self, reason: CloseReason) {
        let _ = self.outbound.send(TransportCommand::Close(reason));
    }
}

/// Whether the transport task should keep reading.
enum Disposition {
    Continue,
    CloseTransport,
}

async fn handle_socket(inner: Arc<ServerInner>, socket: WebSocket, request: RequestInfo) {
    if inner.destroyed.load(Ordering::SeqCst) {
        return;
    }

    let socket_id = Uuid::new_v4();
    let (outbound, commands) = mpsc::unbounded_channel();
    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, commands, Arc::clone(&inner.trace)));

    let mut session = TransportSession {
        socket_id,
        request,
        configuration: Arc::new(ConnectionConfiguration::new(
            inner.chain.requires_authentication(),
        )),
        context: Arc::new(Context::default()),
        outbound,
        queued: HashMap::new(),
        establishing: HashSet::new(),
        attached: HashMap::new(),
    };
    debug!(%socket_id, "transport open");

    let timeout = inner.options.timeout;
    let opened = Instant::now();
    let mut last_activity = Instant::now();
    let mut ticker = interval_at(Instant::now() + timeout, timeout);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut close_event: Option<CloseEvent> = None;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        last_activity = Instant::now();
                        match inner.handle_incoming(&mut session, &bytes).await {
                            Disposition::Continue => {}
                            Disposition::CloseTransport => break,
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_activity = Instant::now();
                        let _ = session.outbound.send(TransportCommand::Pong(payload.to_vec()));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Text(_))) => {
                        last_activity = Instant::now();
                        debug!(%socket_id, "ignoring text message");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        close_event = frame.map(|frame| CloseEvent {
                            code: frame.code,
                            reason: frame.reason.to_string(),
                        });
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(%socket_id, "transport error: {e}");
                        break;
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if session.attached.is_empty() {
                    // Pre-attach idleness: the client never made it through
                    // the handshake.
                    if opened.elapsed() >= timeout {
                        debug!(%socket_id, "closing idle unauthenticated transport");
                        session.close(UNAUTHORIZED);
                        break;
                    }
                } else if last_activity.elapsed() >= timeout * 2 {
                    // Two silent ping intervals.
                    debug!(%socket_id, "keep-alive deadline missed");
                    session.close(RESET_CONNECTION);
                    break;
                } else {
                    let _ = session.outbound.send(TransportCommand::Ping);
                }
            }
        }
    }

    let event = close_event.unwrap_or_else(|| CloseEvent::from(&NORMAL_CLOSURE));
    let attached: Vec<(String, Arc<Connection>)> = session.attached.drain().collect();
    for (document_name, connection) in attached {
        inner.disconnect(&document_name, &connection, &event).await;
    }
    debug!(%socket_id, "transport closed");

    // Dropping the session releases the last command sender; the writer
    // drains whatever is queued (including a pending close frame) and exits.
    drop(session);
    let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    trace: Arc<TraceLog>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            TransportCommand::Send(bytes) => {
                if let Some((document, kind)) = message::peek_frame(&bytes) {
                    trace.record(Direction::Outbound, &document, kind.label(), bytes.len());
                }
                if sink.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            TransportCommand::Ping => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            TransportCommand::Pong(payload) => {
                if sink.send(Message::Pong(payload.into())).await.is_err() {
                    break;
                }
            }
            TransportCommand::Close(reason) => {
                let frame = CloseFrame {
                    code: reason.code,
                    reason: reason.reason.to_string().into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}

// ==================== Handshake State Machine ====================

impl ServerInner {
    /// An owning handle to self, for work that outlives the borrow.
    fn arc(&self) -> Arc<ServerInner> {
        self.weak_self.upgrade().expect("server inner still alive")
    }

    async fn handle_incoming(
        &self,
        session: &mut TransportSession,
        bytes: &[u8],
    ) -> Disposition {
        let frame = match message::decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(socket_id = %session.socket_id, "malformed frame: {e}");
                session.close(UNAUTHORIZED);
                return Disposition::CloseTransport;
            }
        };
        self.trace.record(
            Direction::Inbound,
            &frame.document_name,
            frame.kind.label(),
            bytes.len(),
        );
        let document_name = frame.document_name.clone();

        // Attached documents dispatch directly on their connection.
        if let Some(connection) = session.attached.get(&document_name).cloned() {
            if let Err(e) = connection.handle_frame(&self.chain, frame).await {
                warn!(document = %document_name, "protocol error: {e}");
                session.close(UNAUTHORIZED);
                return Disposition::CloseTransport;
            }
            if let Some(reason) = connection.pending_close() {
                return self.detach(session, &document_name, reason).await;
            }
            return Disposition::Continue;
        }

        let first = !session.queued.contains_key(&document_name);
        if first {
            session.queued.insert(document_name.clone(), Vec::new());
            let payload = ConnectPayload {
                transport: session.transport_payload(),
                document_name: &document_name,
            };
            if let Err(err) = self.chain.on_connect(payload).await {
                warn!(document = %document_name, "connect rejected: {err}");
                session.close(CloseReason::from_hook_error(&err.error, FORBIDDEN));
                return Disposition::CloseTransport;
            }
        }

        if frame.kind == MessageKind::Auth && !session.establishing.contains(&document_name) {
            session.establishing.insert(document_name.clone());
            let token = match message::decode_auth_token(&frame.payload) {
                Ok(token) => token,
                Err(e) => {
                    warn!(document = %document_name, "malformed auth message: {e}");
                    session.close(UNAUTHORIZED);
                    return Disposition::CloseTransport;
                }
            };
            let payload = AuthenticatePayload {
                transport: session.transport_payload(),
                document_name: &document_name,
                token: &token,
            };
            match self.chain.on_authenticate(payload).await {
                Ok(()) => {
                    session.configuration.set_authenticated(true);
                    let scope = if session.configuration.read_only() {
                        "read-only"
                    } else {
                        "read-write"
                    };
                    session.send(message::authenticated(&document_name, scope));
                    if self.attach(session, &document_name).await.is_err() {
                        return Disposition::CloseTransport;
                    }
                }
                Err(err) => {
                    info!(document = %document_name, "authentication failed: {err}");
                    let reason = err
                        .error
                        .reason
                        .clone()
                        .unwrap_or_else(|| "permission-denied".to_string());
                    // The denial is queued ahead of the close frame, so it
                    // reaches the client before the transport goes away.
                    session.send(message::permission_denied(&document_name, &reason));
                    session.close(CloseReason::from_hook_error(&err.error, FORBIDDEN));
                    return Disposition::CloseTransport;
                }
            }
            return Disposition::Continue;
        }

        if let Some(queue) = session.queued.get_mut(&document_name) {
            queue.push(frame);
        }

        if first
            && !session.configuration.requires_authentication()
            && !session.establishing.contains(&document_name)
        {
            session.establishing.insert(document_name.clone());
            if self.attach(session, &document_name).await.is_err() {
                return Disposition::CloseTransport;
            }
        }
        Disposition::Continue
    }

    /// Create the connection for an established transport × document pair,
    /// replay its queued messages in arrival order, and run `connected`.
    async fn attach(
        &self,
        session: &mut TransportSession,
        document_name: &str,
    ) -> Result<(), ()> {
        let document = loop {
            let document = match self.get_or_create_document(session, document_name).await {
                Ok(document) => document,
                Err(err) => {
                    warn!(document = %document_name, "load failed: {err}");
                    session.close(CloseReason::from_hook_error(&err.error, FORBIDDEN));
                    return Err(());
                }
            };

            // Register under the registry lock so a concurrent
            // last-disconnect removal cannot strand this connection on an
            // unregistered instance.
            let registry = self.documents.read().await;
            match registry.get(document_name) {
                Some(existing) if Arc::ptr_eq(existing, &document) => {
                    document
                        .add_connection(Peer {
                            socket_id: session.socket_id,
                            sender: session.outbound.clone(),
                            context: Arc::clone(&session.context),
                        })
                        .await;
                    break document;
                }
                _ => continue,
            }
        };

        let connection = Arc::new(Connection::new(
            session.socket_id,
            Arc::clone(&document),
            session.outbound.clone(),
            session.configuration.read_only(),
            Arc::clone(&session.context),
        ));
        session
            .attached
            .insert(document_name.to_string(), Arc::clone(&connection));

        if let Some(queue) = session.queued.remove(document_name) {
            for frame in queue {
                if let Err(e) = connection.handle_frame(&self.chain, frame).await {
                    warn!(document = %document_name, "protocol error during replay: {e}");
                    session.close(UNAUTHORIZED);
                    return Err(());
                }
            }
            if let Some(reason) = connection.pending_close() {
                return match self.detach(session, document_name, reason).await {
                    Disposition::Continue => Ok(()),
                    Disposition::CloseTransport => Err(()),
                };
            }
        }

        let payload = ConnectedPayload {
            transport: session.transport_payload(),
            document_name,
            document: &document,
            clients_count: document.connections_count(),
        };
        if let Err(err) = self.chain.connected(payload).await {
            warn!(document = %document_name, "connected hook failed: {err}");
        }
        debug!(
            document = %document_name,
            socket_id = %session.socket_id,
            clients = document.connections_count(),
            "connection attached"
        );
        Ok(())
    }

    /// Detach one document from the transport after its connection asked to
    /// close. The close frame goes out only when the transport's attached
    /// set empties.
    async fn detach(
        &self,
        session: &mut TransportSession,
        document_name: &str,
        reason: CloseReason,
    ) -> Disposition {
        if let Some(connection) = session.attached.remove(document_name) {
            let event = CloseEvent::from(&reason);
            self.disconnect(document_name, &connection, &event).await;
        }
        if session.attached.is_empty() {
            session.close(reason);
            Disposition::CloseTransport
        } else {
            Disposition::Continue
        }
    }

    // ==================== Document Lifecycle ====================

    async fn get_or_create_document(
        &self,
        session: &TransportSession,
        document_name: &str,
    ) -> Result<Arc<Document>, HookChainError> {
        loop {
            let existing = {
                let documents = self.documents.read().await;
                documents.get(document_name).cloned()
            };
            if let Some(document) = existing {
                match document.wait_until_loaded().await {
                    LoadState::Ready => return Ok(document),
                    // `Loading` cannot come back from the wait (it only
                    // returns terminal states); it is grouped here so the
                    // arm stays exhaustive if the load lifecycle gains
                    // states. A failed instance is being torn down; make
                    // way and re-attempt the load from scratch.
                    LoadState::Failed | LoadState::Loading => {
                        self.remove_document(document_name, &document).await;
                        continue;
                    }
                }
            }

            let document = Arc::new(Document::new(document_name, self.options.skip_gc));
            {
                let mut documents = self.documents.write().await;
                if documents.contains_key(document_name) {
                    continue;
                }
                documents.insert(document_name.to_string(), Arc::clone(&document));
            }

            if let Err(err) = self.load_document(session, &document, document_name).await {
                document.mark_load_failed();
                document
                    .broadcast_close(CloseReason::from_hook_error(&err.error, FORBIDDEN))
                    .await;
                self.remove_document(document_name, &document).await;
                return Err(err);
            }
            document.set_loaded();

            let payload = DocumentPayload {
                document_name,
                document: &document,
                clients_count: document.connections_count(),
                context: &session.context,
            };
            if let Err(err) = self.chain.after_load_document(payload).await {
                document.mark_load_failed();
                self.remove_document(document_name, &document).await;
                return Err(err);
            }

            self.wire_update_pipeline(&document);
            return Ok(document);
        }
    }

    async fn load_document(
        &self,
        session: &TransportSession,
        document: &Arc<Document>,
        document_name: &str,
    ) -> Result<(), HookChainError> {
        let payload = LoadDocumentPayload {
            transport: session.transport_payload(),
            document_name,
            document,
        };
        let loaded = self.chain.on_load_document(payload).await?;
        for state in loaded {
            let update = match state {
                LoadedState::Update(bytes) => bytes,
                LoadedState::Doc(doc) => {
                    use yrs::{ReadTxn, StateVector, Transact};
                    let txn = doc.transact();
                    txn.encode_state_as_update_v1(&StateVector::default())
                }
            };
            if update.is_empty() {
                continue;
            }
            if let Err(e) = document.apply_update(None, &update).await {
                warn!(document = %document_name, "discarding undecodable loaded state: {e}");
            }
        }
        Ok(())
    }

    fn wire_update_pipeline(&self, document: &Arc<Document>) {
        let inner = self.weak_self.clone();
        let weak_document = Arc::downgrade(document);
        document.subscribe_updates(Box::new(move |event| {
            let Some(inner) = inner.upgrade() else { return };
            let Some(document) = weak_document.upgrade() else {
                return;
            };
            let event = event.clone();
            tokio::spawn(async move {
                inner.update_pipeline(document, event).await;
            });
        }));
    }

    // ==================== Update + Persistence Pipeline ====================

    async fn update_pipeline(self: Arc<Self>, document: Arc<Document>, event: UpdateEvent) {
        let context = match event.origin {
            Some(socket_id) => document
                .peer_context(socket_id)
                .await
                .unwrap_or_default(),
            None => Arc::new(Context::default()),
        };

        let payload = ChangePayload {
            document_name: &event.document_name,
            document: &document,
            update: &event.update,
            origin: event.origin,
            clients_count: document.connections_count(),
            context: &context,
        };
        if let Err(err) = self.chain.on_change(payload).await {
            // Change hooks are observational; a failure never stalls the
            // pipeline.
            warn!(document = %event.document_name, "change hook failed: {err}");
        }

        // Updates without an originating connection were applied
        // programmatically and are not persisted.
        if event.origin.is_none() {
            return;
        }

        // The last client may already be gone, in which case the disconnect
        // path owns the final store.
        if document.connections_count() == 0 {
            return;
        }

        let key = store_key(&event.document_name);
        let inner = Arc::clone(&self);
        let store_context = Arc::clone(&context);
        self.debouncer.debounce(&key, move || async move {
            inner.run_store_hooks(&document, &store_context).await;
        });
    }

    async fn run_store_hooks(&self, document: &Arc<Document>, context: &Context) {
        let state = document.encode_state_as_update().await;
        let payload = StorePayload {
            document_name: document.name(),
            document,
            state: &state,
            context,
        };
        match self.chain.on_store_document(payload).await {
            Ok(()) => {}
            Err(err) if err.error.has_message() => {
                error!(document = %document.name(), "store hook failed: {err}");
            }
            Err(err) => {
                debug!(document = %document.name(), "store hook rejected silently: {err}");
            }
        }
        if let Err(err) = self.chain.after_store_document(payload).await {
            error!(document = %document.name(), "after-store hook failed: {err}");
        }
    }

    // ==================== Disconnection ====================

    async fn disconnect(
        &self,
        document_name: &str,
        connection: &Arc<Connection>,
        event: &CloseEvent,
    ) {
        let document = Arc::clone(connection.document());
        let remaining = document.remove_connection(connection.socket_id()).await;
        connection.run_close_callbacks(event);

        let payload = DisconnectPayload {
            socket_id: connection.socket_id(),
            document_name,
            document: &document,
            clients_count: remaining,
            context: connection.context(),
        };
        if let Err(err) = self.chain.on_disconnect(payload).await {
            warn!(document = %document_name, "disconnect hook failed: {err}");
        }

        if remaining > 0 {
            return;
        }

        if document.is_loading() {
            // A document that never finished loading must not overwrite its
            // canonical state with an empty instance.
            self.remove_document(document_name, &document).await;
            return;
        }

        // Last client gone: flush the pending store immediately and persist
        // the final state before the instance is destroyed.
        let key = store_key(document_name);
        let inner = self.arc();
        let doc = Arc::clone(&document);
        let context = Arc::clone(connection.context());
        self.debouncer
            .flush(&key, move || async move {
                inner.run_store_hooks(&doc, &context).await;
            })
            .await;

        if document.connections_count() == 0 {
            self.remove_document(document_name, &document).await;
        }
    }

    async fn remove_document(&self, document_name: &str, document: &Arc<Document>) {
        let mut documents = self.documents.write().await;
        if let Some(existing) = documents.get(document_name) {
            if Arc::ptr_eq(existing, document) && existing.connections_count() == 0 {
                documents.remove(document_name);
                debug!(document = %document_name, "document destroyed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_keys_are_per_document() {
        assert_eq!(store_key("doc1"), "store:doc1");
        assert_ne!(store_key("doc1"), store_key("doc2"));
    }

    #[test]
    fn hook_status_mapping() {
        let err = HookError::denied("nope").with_code(401);
        assert_eq!(
            status_from_hook(&err, StatusCode::FORBIDDEN),
            StatusCode::UNAUTHORIZED
        );
        // Close codes are not HTTP statuses and fall back.
        let err = HookError::denied("nope").with_code(4403);
        assert_eq!(
            status_from_hook(&err, StatusCode::FORBIDDEN),
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn handle_reports_empty_stats() {
        let server = Server::new(ServerOptions::default());
        let handle = server.handle();
        let stats = handle.stats().await;
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.connections, 0);
        assert!(handle.get_document("missing").await.is_none());
    }

    #[tokio::test]
    async fn configure_is_idempotent() {
        let server = Server::new(ServerOptions::default());
        server.configure().await.unwrap();
        server.configure().await.unwrap();
    }
}
