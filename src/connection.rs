//! One attached client on one document.
//!
//! A connection owns the sub-protocol dispatch for its document: sync,
//! awareness, the stateless side-channel, and the acknowledgement types.
//! Sends are best-effort; close is idempotent and runs its callbacks exactly
//! once. The kernel guarantees a connection only ever sees frames for its
//! own document.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::{CloseReason, Context, FORBIDDEN, NORMAL_CLOSURE};
use crate::document::Document;
use crate::error::ConnectionError;
use crate::extension::{
    AwarenessPayload, ExtensionChain, MessagePayload, StatelessPayload,
};
use crate::message::{self, IncomingFrame, MessageKind, SyncPayload};

/// Commands accepted by a transport's writer task.
#[derive(Debug, Clone)]
pub enum TransportCommand {
    /// Write a binary frame.
    Send(Vec<u8>),
    /// Write a keep-alive ping.
    Ping,
    /// Answer a client ping.
    Pong(Vec<u8>),
    /// Write a close frame and stop the writer.
    Close(CloseReason),
}

/// What close callbacks receive.
#[derive(Debug, Clone)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl From<&CloseReason> for CloseEvent {
    fn from(reason: &CloseReason) -> Self {
        Self {
            code: reason.code,
            reason: reason.reason.to_string(),
        }
    }
}

type CloseCallback = Box<dyn FnOnce(&Arc<Document>, &CloseEvent) + Send>;

/// A client attached to a document over one transport.
pub struct Connection {
    socket_id: Uuid,
    document: Arc<Document>,
    outbound: mpsc::UnboundedSender<TransportCommand>,
    read_only: AtomicBool,
    context: Arc<Context>,
    closed: AtomicBool,
    close_reason: StdMutex<Option<CloseReason>>,
    close_callbacks: StdMutex<Vec<CloseCallback>>,
}

impl Connection {
    pub fn new(
        socket_id: Uuid,
        document: Arc<Document>,
        outbound: mpsc::UnboundedSender<TransportCommand>,
        read_only: bool,
        context: Arc<Context>,
    ) -> Self {
        Self {
            socket_id,
            document,
            outbound,
            read_only: AtomicBool::new(read_only),
            context,
            closed: AtomicBool::new(false),
            close_reason: StdMutex::new(None),
            close_callbacks: StdMutex::new(Vec::new()),
        }
    }

    pub fn socket_id(&self) -> Uuid {
        self.socket_id
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Best-effort write. Drops silently once the connection is closing; a
    /// dead transport channel marks the connection closed.
    pub fn send(&self, frame: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        if self.outbound.send(TransportCommand::Send(frame)).is_err() {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Initiate close with the given reason. Idempotent; the transport task
    /// observes the pending reason, detaches the connection, and sends the
    /// close frame once its last document detaches.
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.close_reason.lock().expect("close lock poisoned") = Some(reason);
    }

    /// The reason a close was requested with, if any.
    pub fn pending_close(&self) -> Option<CloseReason> {
        self.close_reason
            .lock()
            .expect("close lock poisoned")
            .clone()
    }

    /// Register a callback invoked exactly once when the connection closes,
    /// carrying the document and the close event.
    pub fn on_close(&self, callback: CloseCallback) {
        self.close_callbacks
            .lock()
            .expect("close lock poisoned")
            .push(callback);
    }

    /// Run and drop the close callbacks. Safe to call more than once.
    pub(crate) fn run_close_callbacks(&self, event: &CloseEvent) {
        self.closed.store(true, Ordering::SeqCst);
        let callbacks = std::mem::take(
            &mut *self
                .close_callbacks
                .lock()
                .expect("close lock poisoned"),
        );
        for callback in callbacks {
            callback(&self.document, event);
        }
    }

    /// Dispatch one frame for this connection's document.
    pub async fn handle_frame(
        &self,
        chain: &ExtensionChain,
        frame: IncomingFrame,
    ) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Ok(());
        }

        let gate = MessagePayload {
            socket_id: self.socket_id,
            document_name: self.document.name(),
            document: &self.document,
            kind: frame.kind,
            context: &self.context,
        };
        if let Err(err) = chain.before_handle_message(gate).await {
            warn!(socket_id = %self.socket_id, "message rejected: {err}");
            self.close(CloseReason::from_hook_error(&err.error, FORBIDDEN));
            return Ok(());
        }

        match frame.kind {
            MessageKind::Sync | MessageKind::SyncReply => {
                let payload = SyncPayload::decode(&frame.payload)?;
                let responses = self
                    .document
                    .handle_sync(self.socket_id, payload, self.is_read_only())
                    .await?;
                for response in responses {
                    self.send(response);
                }
            }
            MessageKind::Awareness => {
                self.document.handle_awareness(&frame.payload).await?;
                let payload = AwarenessPayload {
                    document_name: self.document.name(),
                    document: &self.document,
                    update: &frame.payload,
                    socket_id: self.socket_id,
                    context: &self.context,
                };
                if let Err(err) = chain.on_awareness_update(payload).await {
                    warn!("awareness hook failed: {err}");
                }
            }
            MessageKind::QueryAwareness => {
                let reply = self.document.full_awareness_frame().await?;
                self.send(reply);
            }
            MessageKind::Stateless => {
                let payload = message::decode_stateless(&frame.payload)?;
                let hook_payload = StatelessPayload {
                    document_name: self.document.name(),
                    document: &self.document,
                    payload: &payload,
                    socket_id: Some(self.socket_id),
                    context: &self.context,
                };
                if let Err(err) = chain.on_stateless(hook_payload).await {
                    warn!("stateless hook failed: {err}");
                }
            }
            MessageKind::BroadcastStateless => {
                let payload = message::decode_stateless(&frame.payload)?;
                let hook_payload = StatelessPayload {
                    document_name: self.document.name(),
                    document: &self.document,
                    payload: &payload,
                    socket_id: Some(self.socket_id),
                    context: &self.context,
                };
                match chain.before_broadcast_stateless(hook_payload).await {
                    Ok(()) => {
                        self.document
                            .broadcast_stateless(&payload, Some(self.socket_id))
                            .await;
                    }
                    Err(err) => warn!("stateless broadcast suppressed: {err}"),
                }
            }
            MessageKind::SyncStatus => {
                let applied = message::decode_sync_status(&frame.payload)?;
                self.send(message::sync_status(self.document.name(), applied));
            }
            MessageKind::Auth => {
                debug!(socket_id = %self.socket_id, "auth message after attach ignored");
            }
            MessageKind::Close => {
                self.close(NORMAL_CLOSURE);
            }
            MessageKind::Unknown(value) => {
                debug!(kind = value, "ignoring unknown message type");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("socket_id", &self.socket_id)
            .field("document", &self.document.name())
            .field("read_only", &self.is_read_only())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RESET_CONNECTION;
    use std::sync::atomic::AtomicUsize;

    fn test_connection() -> (Connection, mpsc::UnboundedReceiver<TransportCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let document = Arc::new(Document::new("doc", false));
        let connection = Connection::new(
            Uuid::new_v4(),
            document,
            tx,
            false,
            Arc::new(Context::default()),
        );
        (connection, rx)
    }

    #[tokio::test]
    async fn send_after_close_is_dropped() {
        let (connection, mut rx) = test_connection();
        connection.close(RESET_CONNECTION);
        connection.send(vec![1, 2, 3]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_keeps_the_first_reason() {
        let (connection, _rx) = test_connection();
        connection.close(RESET_CONNECTION);
        connection.close(FORBIDDEN);
        assert_eq!(connection.pending_close(), Some(RESET_CONNECTION));
    }

    #[tokio::test]
    async fn close_callbacks_run_exactly_once() {
        let (connection, _rx) = test_connection();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        connection.on_close(Box::new(move |_document, event| {
            assert_eq!(event.code, RESET_CONNECTION.code);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let event = CloseEvent::from(&RESET_CONNECTION);
        connection.run_close_callbacks(&event);
        connection.run_close_callbacks(&event);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_transport_marks_the_connection_closed() {
        let (connection, rx) = test_connection();
        drop(rx);
        connection.send(vec![9]);
        assert!(connection.is_closed());
    }
}
