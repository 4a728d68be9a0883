//! A hosted document: one Y-CRDT instance, its awareness state, and the
//! set of connections currently attached to it.
//!
//! The document applies incoming sync payloads, fans updates out to every
//! *other* attached connection, relays awareness to all of them, and fires
//! its update subscribers so the kernel can drive the persistence pipeline.
//! Membership is mutated only by the kernel (attach) and the connection
//! close path (detach).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;
use yrs::sync::awareness::AwarenessUpdate;
use yrs::sync::Awareness;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, StateVector, Transact, Update};

use crate::connection::TransportCommand;
use crate::context::{CloseReason, Context};
use crate::error::DocumentError;
use crate::message::{self, SyncPayload};

/// Load lifecycle of a document instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Created, load hooks still running; must not persist.
    Loading,
    /// Load hooks finished; fully live.
    Ready,
    /// Load hooks rejected; the instance is being torn down.
    Failed,
}

/// An update applied to the document.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub document_name: String,
    /// Originating connection; `None` for programmatic application.
    pub origin: Option<Uuid>,
    pub update: Vec<u8>,
}

/// Callback invoked for every update applied to a document.
pub type UpdateSubscriber = Box<dyn Fn(&UpdateEvent) + Send + Sync>;

/// An attached connection's transport endpoint, as seen by the document.
pub struct Peer {
    pub socket_id: Uuid,
    pub sender: mpsc::UnboundedSender<TransportCommand>,
    pub context: Arc<Context>,
}

struct DocumentState {
    awareness: Awareness,
    peers: HashMap<Uuid, Peer>,
}

/// One shared document. At most one instance per name exists in a server.
pub struct Document {
    name: String,
    is_loading: AtomicBool,
    connection_count: AtomicUsize,
    state: Mutex<DocumentState>,
    subscribers: StdMutex<Vec<UpdateSubscriber>>,
    load_tx: watch::Sender<LoadState>,
}

impl Document {
    pub fn new(name: impl Into<String>, skip_gc: bool) -> Self {
        let doc = Doc::with_options(Options {
            skip_gc,
            ..Options::default()
        });
        let (load_tx, _) = watch::channel(LoadState::Loading);
        Self {
            name: name.into(),
            is_loading: AtomicBool::new(true),
            connection_count: AtomicUsize::new(0),
            state: Mutex::new(DocumentState {
                awareness: Awareness::new(doc),
                peers: HashMap::new(),
            }),
            subscribers: StdMutex::new(Vec::new()),
            load_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.load(Ordering::SeqCst)
    }

    /// Mark load hooks as finished.
    pub fn set_loaded(&self) {
        self.is_loading.store(false, Ordering::SeqCst);
        let _ = self.load_tx.send(LoadState::Ready);
    }

    /// Mark the load as failed; waiting attachers give up.
    pub fn mark_load_failed(&self) {
        let _ = self.load_tx.send(LoadState::Failed);
    }

    /// Wait for the load hooks to settle. Returns the terminal state.
    pub async fn wait_until_loaded(&self) -> LoadState {
        let mut rx = self.load_tx.subscribe();
        loop {
            let state = *rx.borrow();
            match state {
                LoadState::Loading => {
                    if rx.changed().await.is_err() {
                        return LoadState::Failed;
                    }
                }
                terminal => return terminal,
            }
        }
    }

    // ==================== Membership ====================

    pub async fn add_connection(&self, peer: Peer) -> usize {
        let mut state = self.state.lock().await;
        state.peers.insert(peer.socket_id, peer);
        let count = state.peers.len();
        self.connection_count.store(count, Ordering::SeqCst);
        count
    }

    /// Remove a connection, returning how many remain.
    pub async fn remove_connection(&self, socket_id: Uuid) -> usize {
        let mut state = self.state.lock().await;
        state.peers.remove(&socket_id);
        let count = state.peers.len();
        self.connection_count.store(count, Ordering::SeqCst);
        count
    }

    pub fn connections_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// The context of an attached connection.
    pub async fn peer_context(&self, socket_id: Uuid) -> Option<Arc<Context>> {
        let state = self.state.lock().await;
        state
            .peers
            .get(&socket_id)
            .map(|peer| Arc::clone(&peer.context))
    }

    // ==================== Update Events ====================

    /// Register an update subscriber. Subscribers run in registration order
    /// on every applied update, after fan-out.
    pub fn subscribe_updates(&self, subscriber: UpdateSubscriber) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(subscriber);
    }

    fn notify_update(&self, event: &UpdateEvent) {
        let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        for subscriber in subscribers.iter() {
            subscriber(event);
        }
    }

    // ==================== Sync Protocol ====================

    /// Handle a decoded sync payload from an attached connection, returning
    /// the frames to send back to that connection.
    pub async fn handle_sync(
        &self,
        origin: Uuid,
        payload: SyncPayload,
        read_only: bool,
    ) -> Result<Vec<Vec<u8>>, DocumentError> {
        match payload {
            SyncPayload::Step1(remote_sv) => {
                let state = self.state.lock().await;
                let txn = state.awareness.doc().transact();
                let diff = if remote_sv.is_empty() {
                    txn.encode_state_as_update_v1(&StateVector::default())
                } else {
                    match StateVector::decode_v1(&remote_sv) {
                        Ok(sv) => txn.encode_diff_v1(&sv),
                        Err(e) => {
                            warn!(
                                document = %self.name,
                                "undecodable state vector ({e}), sending full state"
                            );
                            txn.encode_state_as_update_v1(&StateVector::default())
                        }
                    }
                };
                let own_sv = txn.state_vector().encode_v1();
                drop(txn);
                drop(state);
                Ok(vec![
                    message::sync_step2(&self.name, &diff),
                    message::sync_step1(&self.name, &own_sv),
                ])
            }
            SyncPayload::Step2(update) | SyncPayload::Update(update) => {
                if read_only {
                    debug!(
                        document = %self.name,
                        %origin,
                        "dropping update from read-only connection"
                    );
                    return Ok(Vec::new());
                }
                if update.is_empty() {
                    return Ok(Vec::new());
                }
                self.apply_update(Some(origin), &update).await?;
                Ok(vec![message::sync_status(&self.name, true)])
            }
        }
    }

    /// Apply an update and fan it out to every attached connection except
    /// the origin. `origin: None` marks a programmatic update, which still
    /// fans out but is never persisted downstream.
    pub async fn apply_update(
        &self,
        origin: Option<Uuid>,
        update: &[u8],
    ) -> Result<(), DocumentError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        {
            let state = self.state.lock().await;
            let mut txn = state.awareness.doc().transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| DocumentError::ApplyFailed(e.to_string()))?;
            drop(txn);

            let frame = message::sync_update(&self.name, update);
            for (socket_id, peer) in state.peers.iter() {
                if Some(*socket_id) == origin {
                    continue;
                }
                let _ = peer.sender.send(TransportCommand::Send(frame.clone()));
            }
        }
        self.notify_update(&UpdateEvent {
            document_name: self.name.clone(),
            origin,
            update: update.to_vec(),
        });
        Ok(())
    }

    // ==================== Awareness ====================

    /// Apply an awareness payload and relay it to every attached
    /// connection.
    pub async fn handle_awareness(&self, payload: &[u8]) -> Result<(), DocumentError> {
        let mut reader = message::Reader::new(payload);
        let bytes = reader.read_var_bytes()?;
        let update = AwarenessUpdate::decode_v1(bytes)
            .map_err(|e| DocumentError::Awareness(e.to_string()))?;

        let mut state = self.state.lock().await;
        state
            .awareness
            .apply_update(update)
            .map_err(|e| DocumentError::Awareness(e.to_string()))?;

        let frame = message::awareness(&self.name, bytes);
        for peer in state.peers.values() {
            let _ = peer.sender.send(TransportCommand::Send(frame.clone()));
        }
        Ok(())
    }

    /// The full awareness state, framed for a single connection.
    pub async fn full_awareness_frame(&self) -> Result<Vec<u8>, DocumentError> {
        let state = self.state.lock().await;
        let update = state
            .awareness
            .update()
            .map_err(|e| DocumentError::Awareness(e.to_string()))?;
        Ok(message::awareness(&self.name, &update.encode_v1()))
    }

    // ==================== Stateless Side-Channel ====================

    /// Fan a stateless payload out to every attached connection except
    /// `exclude`.
    pub async fn broadcast_stateless(&self, payload: &str, exclude: Option<Uuid>) {
        let frame = message::stateless(&self.name, payload);
        let state = self.state.lock().await;
        for (socket_id, peer) in state.peers.iter() {
            if Some(*socket_id) == exclude {
                continue;
            }
            let _ = peer.sender.send(TransportCommand::Send(frame.clone()));
        }
    }

    // ==================== State Access ====================

    /// Full document state encoded as a single update.
    pub async fn encode_state_as_update(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        let txn = state.awareness.doc().transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// The document's state vector.
    pub async fn encode_state_vector(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        let txn = state.awareness.doc().transact();
        txn.state_vector().encode_v1()
    }

    /// Ask every attached transport to close.
    pub async fn broadcast_close(&self, reason: CloseReason) {
        let state = self.state.lock().await;
        for peer in state.peers.values() {
            let _ = peer.sender.send(TransportCommand::Close(reason.clone()));
        }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("name", &self.name)
            .field("is_loading", &self.is_loading())
            .field("connections", &self.connections_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{decode_frame, MessageKind};
    use yrs::{GetString, Text};

    fn encoded_insert(text: &str) -> Vec<u8> {
        let doc = Doc::new();
        let field = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            field.insert(&mut txn, 0, text);
        }
        let update = doc.transact().encode_state_as_update_v1(&StateVector::default());
        update
    }

    fn text_content(state: &[u8]) -> String {
        let doc = Doc::new();
        let field = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
        }
        let txn = doc.transact();
        field.get_string(&txn)
    }

    async fn test_peer(doc: &Document) -> (Uuid, mpsc::UnboundedReceiver<TransportCommand>) {
        let socket_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        doc.add_connection(Peer {
            socket_id,
            sender: tx,
            context: Arc::new(Context::default()),
        })
        .await;
        (socket_id, rx)
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<TransportCommand>) -> Option<Vec<u8>> {
        match rx.try_recv() {
            Ok(TransportCommand::Send(bytes)) => Some(bytes),
            _ => None,
        }
    }

    #[tokio::test]
    async fn membership_counts() {
        let doc = Document::new("doc", false);
        assert_eq!(doc.connections_count(), 0);
        let (a, _rx_a) = test_peer(&doc).await;
        let (_b, _rx_b) = test_peer(&doc).await;
        assert_eq!(doc.connections_count(), 2);
        assert_eq!(doc.remove_connection(a).await, 1);
        assert_eq!(doc.connections_count(), 1);
    }

    #[tokio::test]
    async fn step1_with_empty_state_vector_returns_full_state() {
        let doc = Document::new("doc", false);
        doc.apply_update(None, &encoded_insert("hello")).await.unwrap();

        let origin = Uuid::new_v4();
        let responses = doc
            .handle_sync(origin, SyncPayload::Step1(Vec::new()), false)
            .await
            .unwrap();
        assert_eq!(responses.len(), 2);

        let step2 = decode_frame(&responses[0]).unwrap();
        assert_eq!(step2.kind, MessageKind::Sync);
        match SyncPayload::decode(&step2.payload).unwrap() {
            SyncPayload::Step2(state) => assert_eq!(text_content(&state), "hello"),
            other => panic!("expected Step2, got {other:?}"),
        }

        let step1 = decode_frame(&responses[1]).unwrap();
        assert!(matches!(
            SyncPayload::decode(&step1.payload).unwrap(),
            SyncPayload::Step1(_)
        ));
    }

    #[tokio::test]
    async fn updates_fan_out_to_everyone_but_the_origin() {
        let doc = Document::new("doc", false);
        let (origin, mut origin_rx) = test_peer(&doc).await;
        let (_peer, mut peer_rx) = test_peer(&doc).await;

        let update = encoded_insert("shared");
        let responses = doc
            .handle_sync(origin, SyncPayload::Update(update.clone()), false)
            .await
            .unwrap();

        // The origin gets a sync-status ack, not its own update echoed.
        assert_eq!(responses.len(), 1);
        let ack = decode_frame(&responses[0]).unwrap();
        assert_eq!(ack.kind, MessageKind::SyncStatus);
        assert!(next_frame(&mut origin_rx).is_none());

        let forwarded = next_frame(&mut peer_rx).expect("peer should receive the update");
        let frame = decode_frame(&forwarded).unwrap();
        assert_eq!(frame.document_name, "doc");
        match SyncPayload::decode(&frame.payload).unwrap() {
            SyncPayload::Update(bytes) => assert_eq!(bytes, update),
            other => panic!("expected Update, got {other:?}"),
        }
        assert!(next_frame(&mut peer_rx).is_none());
    }

    #[tokio::test]
    async fn read_only_connections_cannot_write() {
        let doc = Document::new("doc", false);
        let (origin, _origin_rx) = test_peer(&doc).await;
        let (_peer, mut peer_rx) = test_peer(&doc).await;

        let responses = doc
            .handle_sync(origin, SyncPayload::Update(encoded_insert("nope")), true)
            .await
            .unwrap();
        assert!(responses.is_empty());
        assert!(next_frame(&mut peer_rx).is_none());
        assert_eq!(text_content(&doc.encode_state_as_update().await), "");
    }

    #[tokio::test]
    async fn update_subscribers_observe_origin() {
        let doc = Document::new("doc", false);
        let seen: Arc<StdMutex<Vec<Option<Uuid>>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        doc.subscribe_updates(Box::new(move |event| {
            sink.lock().unwrap().push(event.origin);
        }));

        let origin = Uuid::new_v4();
        doc.apply_update(Some(origin), &encoded_insert("a"))
            .await
            .unwrap();
        doc.apply_update(None, &encoded_insert("b")).await.unwrap();

        let observed = seen.lock().unwrap().clone();
        assert_eq!(observed, vec![Some(origin), None]);
    }

    #[tokio::test]
    async fn load_state_transitions() {
        let doc = Arc::new(Document::new("doc", false));
        assert!(doc.is_loading());

        let waiter = {
            let doc = Arc::clone(&doc);
            tokio::spawn(async move { doc.wait_until_loaded().await })
        };
        doc.set_loaded();
        assert_eq!(waiter.await.unwrap(), LoadState::Ready);
        assert!(!doc.is_loading());
    }

    #[tokio::test]
    async fn stateless_broadcast_excludes_the_origin() {
        let doc = Document::new("doc", false);
        let (origin, mut origin_rx) = test_peer(&doc).await;
        let (_peer, mut peer_rx) = test_peer(&doc).await;

        doc.broadcast_stateless("ping", Some(origin)).await;
        assert!(next_frame(&mut origin_rx).is_none());

        let frame = decode_frame(&next_frame(&mut peer_rx).unwrap()).unwrap();
        assert_eq!(frame.kind, MessageKind::Stateless);
        assert_eq!(
            message::decode_stateless(&frame.payload).unwrap(),
            "ping"
        );
    }
}
