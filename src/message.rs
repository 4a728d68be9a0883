//! Wire codec for the framed document protocol.
//!
//! Every message on the transport names the document it belongs to, followed
//! by a message type and a type-specific payload:
//!
//! ```text
//! [varstring document-name] [varuint type] [payload…]
//! ```
//!
//! Sync payloads carry a subtype (`Step1`, `Step2`, `Update`) and a
//! length-prefixed buffer of Y-CRDT bytes. Awareness payloads are a
//! length-prefixed awareness update. Auth payloads carry a subtype and a
//! string (token, denial reason, or granted scope). Stateless payloads are a
//! plain string. Unknown message types decode into [`MessageKind::Unknown`]
//! and are tolerated by the dispatch layer.
//!
//! The kernel only ever interprets the document name and the type; payload
//! bytes stay opaque until the matching sub-protocol handler reads them.

use crate::error::CodecError;

/// Message type values on the wire.
mod kind {
    pub const SYNC: u64 = 0;
    pub const AWARENESS: u64 = 1;
    pub const AUTH: u64 = 2;
    pub const QUERY_AWARENESS: u64 = 3;
    pub const SYNC_REPLY: u64 = 4;
    pub const STATELESS: u64 = 5;
    pub const BROADCAST_STATELESS: u64 = 6;
    pub const CLOSE: u64 = 7;
    pub const SYNC_STATUS: u64 = 8;
}

/// Sync sub-message types.
mod sync_type {
    /// State vector exchange.
    pub const STEP1: u64 = 0;
    /// Missing updates response.
    pub const STEP2: u64 = 1;
    /// Incremental update.
    pub const UPDATE: u64 = 2;
}

/// Auth sub-message types.
mod auth_type {
    /// Client-supplied token.
    pub const TOKEN: u64 = 0;
    /// Server denial, carries a reason string.
    pub const PERMISSION_DENIED: u64 = 1;
    /// Server grant, carries the granted scope.
    pub const AUTHENTICATED: u64 = 2;
}

/// Decoded message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Sync,
    Awareness,
    Auth,
    QueryAwareness,
    SyncReply,
    Stateless,
    BroadcastStateless,
    Close,
    SyncStatus,
    /// Tolerated but unrecognized type value.
    Unknown(u64),
}

impl MessageKind {
    /// Map a wire value onto a kind. Unrecognized values are preserved.
    pub fn from_u64(value: u64) -> Self {
        match value {
            kind::SYNC => MessageKind::Sync,
            kind::AWARENESS => MessageKind::Awareness,
            kind::AUTH => MessageKind::Auth,
            kind::QUERY_AWARENESS => MessageKind::QueryAwareness,
            kind::SYNC_REPLY => MessageKind::SyncReply,
            kind::STATELESS => MessageKind::Stateless,
            kind::BROADCAST_STATELESS => MessageKind::BroadcastStateless,
            kind::CLOSE => MessageKind::Close,
            kind::SYNC_STATUS => MessageKind::SyncStatus,
            other => MessageKind::Unknown(other),
        }
    }

    /// The wire value for this kind.
    pub fn as_u64(self) -> u64 {
        match self {
            MessageKind::Sync => kind::SYNC,
            MessageKind::Awareness => kind::AWARENESS,
            MessageKind::Auth => kind::AUTH,
            MessageKind::QueryAwareness => kind::QUERY_AWARENESS,
            MessageKind::SyncReply => kind::SYNC_REPLY,
            MessageKind::Stateless => kind::STATELESS,
            MessageKind::BroadcastStateless => kind::BROADCAST_STATELESS,
            MessageKind::Close => kind::CLOSE,
            MessageKind::SyncStatus => kind::SYNC_STATUS,
            MessageKind::Unknown(v) => v,
        }
    }

    /// Short label for logging.
    pub fn label(self) -> &'static str {
        match self {
            MessageKind::Sync => "sync",
            MessageKind::Awareness => "awareness",
            MessageKind::Auth => "auth",
            MessageKind::QueryAwareness => "query-awareness",
            MessageKind::SyncReply => "sync-reply",
            MessageKind::Stateless => "stateless",
            MessageKind::BroadcastStateless => "broadcast-stateless",
            MessageKind::Close => "close",
            MessageKind::SyncStatus => "sync-status",
            MessageKind::Unknown(_) => "unknown",
        }
    }
}

// ==================== Primitive Reader/Writer ====================

/// Cursor over an incoming message body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Read an LEB128-style variable-length unsigned integer.
    pub fn read_var_u64(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = *self.buf.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
            self.pos += 1;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                return Err(CodecError::VarIntOverflow);
            }
        }
    }

    /// Read a length-prefixed byte buffer.
    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_var_u64()? as usize;
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        if end > self.buf.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_var_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    /// The unread remainder of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn write_var_string(buf: &mut Vec<u8>, value: &str) {
    write_var_bytes(buf, value.as_bytes());
}

// ==================== Incoming Frames ====================

/// A decoded inbound message: document name, type, opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFrame {
    pub document_name: String,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Decode the outer framing of an inbound message.
pub fn decode_frame(data: &[u8]) -> Result<IncomingFrame, CodecError> {
    let mut reader = Reader::new(data);
    let document_name = reader.read_var_string()?;
    let kind = MessageKind::from_u64(reader.read_var_u64()?);
    Ok(IncomingFrame {
        document_name,
        kind,
        payload: reader.rest().to_vec(),
    })
}

/// Decode just the header of a frame, without copying the payload.
pub fn peek_frame(data: &[u8]) -> Option<(String, MessageKind)> {
    let mut reader = Reader::new(data);
    let document_name = reader.read_var_string().ok()?;
    let kind = MessageKind::from_u64(reader.read_var_u64().ok()?);
    Some((document_name, kind))
}

/// Decoded sync sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPayload {
    /// Remote state vector; answered with a diff plus our own state vector.
    Step1(Vec<u8>),
    /// Updates the remote computed against our state vector.
    Step2(Vec<u8>),
    /// Live incremental update.
    Update(Vec<u8>),
}

impl SyncPayload {
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(payload);
        let subtype = reader.read_var_u64()?;
        let body = reader.read_var_bytes()?.to_vec();
        match subtype {
            sync_type::STEP1 => Ok(SyncPayload::Step1(body)),
            sync_type::STEP2 => Ok(SyncPayload::Step2(body)),
            sync_type::UPDATE => Ok(SyncPayload::Update(body)),
            other => Err(CodecError::UnknownSyncType(other)),
        }
    }
}

/// Read the token out of a client auth payload.
pub fn decode_auth_token(payload: &[u8]) -> Result<String, CodecError> {
    let mut reader = Reader::new(payload);
    let subtype = reader.read_var_u64()?;
    if subtype != auth_type::TOKEN {
        return Err(CodecError::UnexpectedAuthType(subtype));
    }
    reader.read_var_string()
}

/// Read a stateless payload string.
pub fn decode_stateless(payload: &[u8]) -> Result<String, CodecError> {
    Reader::new(payload).read_var_string()
}

/// Read a sync-status flag.
pub fn decode_sync_status(payload: &[u8]) -> Result<bool, CodecError> {
    Ok(Reader::new(payload).read_var_u64()? != 0)
}

// ==================== Outgoing Frames ====================

fn frame_header(document_name: &str, kind: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(document_name.len() + 4);
    write_var_string(&mut buf, document_name);
    write_var_u64(&mut buf, kind);
    buf
}

fn sync_frame(document_name: &str, subtype: u64, body: &[u8]) -> Vec<u8> {
    let mut buf = frame_header(document_name, kind::SYNC);
    write_var_u64(&mut buf, subtype);
    write_var_bytes(&mut buf, body);
    buf
}

/// Sync Step1: our state vector, asking the remote for what we are missing.
pub fn sync_step1(document_name: &str, state_vector: &[u8]) -> Vec<u8> {
    sync_frame(document_name, sync_type::STEP1, state_vector)
}

/// Sync Step2: updates the remote is missing.
pub fn sync_step2(document_name: &str, update: &[u8]) -> Vec<u8> {
    sync_frame(document_name, sync_type::STEP2, update)
}

/// Live incremental update.
pub fn sync_update(document_name: &str, update: &[u8]) -> Vec<u8> {
    sync_frame(document_name, sync_type::UPDATE, update)
}

/// Awareness update relay.
pub fn awareness(document_name: &str, update: &[u8]) -> Vec<u8> {
    let mut buf = frame_header(document_name, kind::AWARENESS);
    write_var_bytes(&mut buf, update);
    buf
}

/// Client-side request for the full awareness state.
pub fn query_awareness(document_name: &str) -> Vec<u8> {
    frame_header(document_name, kind::QUERY_AWARENESS)
}

/// Client-side auth message carrying a token.
pub fn auth_token(document_name: &str, token: &str) -> Vec<u8> {
    let mut buf = frame_header(document_name, kind::AUTH);
    write_var_u64(&mut buf, auth_type::TOKEN);
    write_var_string(&mut buf, token);
    buf
}

/// Server grant after successful authentication, carrying the scope.
pub fn authenticated(document_name: &str, scope: &str) -> Vec<u8> {
    let mut buf = frame_header(document_name, kind::AUTH);
    write_var_u64(&mut buf, auth_type::AUTHENTICATED);
    write_var_string(&mut buf, scope);
    buf
}

/// Server denial after failed authentication, carrying the reason.
pub fn permission_denied(document_name: &str, reason: &str) -> Vec<u8> {
    let mut buf = frame_header(document_name, kind::AUTH);
    write_var_u64(&mut buf, auth_type::PERMISSION_DENIED);
    write_var_string(&mut buf, reason);
    buf
}

/// Decoded server auth reply, used by clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    Authenticated { scope: String },
    PermissionDenied { reason: String },
}

/// Read a server auth reply out of an auth payload.
pub fn decode_auth_reply(payload: &[u8]) -> Result<AuthReply, CodecError> {
    let mut reader = Reader::new(payload);
    let subtype = reader.read_var_u64()?;
    let value = reader.read_var_string()?;
    match subtype {
        auth_type::AUTHENTICATED => Ok(AuthReply::Authenticated { scope: value }),
        auth_type::PERMISSION_DENIED => Ok(AuthReply::PermissionDenied { reason: value }),
        other => Err(CodecError::UnexpectedAuthType(other)),
    }
}

/// Application payload on the stateless side-channel.
pub fn stateless(document_name: &str, payload: &str) -> Vec<u8> {
    let mut buf = frame_header(document_name, kind::STATELESS);
    write_var_string(&mut buf, payload);
    buf
}

/// Client-side request to fan a stateless payload out to peers.
pub fn broadcast_stateless(document_name: &str, payload: &str) -> Vec<u8> {
    let mut buf = frame_header(document_name, kind::BROADCAST_STATELESS);
    write_var_string(&mut buf, payload);
    buf
}

/// Sync status acknowledgement.
pub fn sync_status(document_name: &str, applied: bool) -> Vec<u8> {
    let mut buf = frame_header(document_name, kind::SYNC_STATUS);
    write_var_u64(&mut buf, u64::from(applied));
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_u64_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            write_var_u64(&mut buf, value);
            let mut reader = Reader::new(&buf);
            assert_eq!(reader.read_var_u64().unwrap(), value);
            assert!(reader.rest().is_empty());
        }
    }

    #[test]
    fn var_u64_rejects_overflow() {
        // Eleven continuation bytes push past 64 bits.
        let buf = [0xFFu8; 11];
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_var_u64(), Err(CodecError::VarIntOverflow));
    }

    #[test]
    fn frame_round_trip() {
        let frame = sync_update("notes/today", &[1, 2, 3, 4]);
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.document_name, "notes/today");
        assert_eq!(decoded.kind, MessageKind::Sync);
        let payload = SyncPayload::decode(&decoded.payload).unwrap();
        assert_eq!(payload, SyncPayload::Update(vec![1, 2, 3, 4]));
    }

    #[test]
    fn sync_subtypes_round_trip() {
        let step1 = decode_frame(&sync_step1("d", &[9])).unwrap();
        assert_eq!(
            SyncPayload::decode(&step1.payload).unwrap(),
            SyncPayload::Step1(vec![9])
        );
        let step2 = decode_frame(&sync_step2("d", &[8, 7])).unwrap();
        assert_eq!(
            SyncPayload::decode(&step2.payload).unwrap(),
            SyncPayload::Step2(vec![8, 7])
        );
    }

    #[test]
    fn unknown_message_kind_is_tolerated() {
        let mut buf = Vec::new();
        write_var_string(&mut buf, "doc");
        write_var_u64(&mut buf, 42);
        buf.extend_from_slice(&[1, 2, 3]);
        let decoded = decode_frame(&buf).unwrap();
        assert_eq!(decoded.kind, MessageKind::Unknown(42));
        assert_eq!(decoded.kind.label(), "unknown");
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let frame = sync_update("doc", &[1, 2, 3]);
        // Slice off the tail so the length-prefixed buffer overruns.
        let truncated = &frame[..frame.len() - 2];
        let decoded = decode_frame(truncated).unwrap();
        assert_eq!(
            SyncPayload::decode(&decoded.payload),
            Err(CodecError::UnexpectedEof)
        );
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(decode_frame(&[]), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn invalid_utf8_document_name_is_an_error() {
        let buf = [2u8, 0xFF, 0xFE, 0];
        assert_eq!(decode_frame(&buf), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn auth_token_round_trip() {
        let frame = decode_frame(&auth_token("doc", "secret")).unwrap();
        assert_eq!(frame.kind, MessageKind::Auth);
        assert_eq!(decode_auth_token(&frame.payload).unwrap(), "secret");
    }

    #[test]
    fn auth_replies_round_trip() {
        let granted = decode_frame(&authenticated("doc", "read-write")).unwrap();
        assert_eq!(
            decode_auth_reply(&granted.payload).unwrap(),
            AuthReply::Authenticated {
                scope: "read-write".into()
            }
        );
        let denied = decode_frame(&permission_denied("doc", "permission-denied")).unwrap();
        assert_eq!(
            decode_auth_reply(&denied.payload).unwrap(),
            AuthReply::PermissionDenied {
                reason: "permission-denied".into()
            }
        );
    }

    #[test]
    fn token_is_not_a_valid_auth_reply() {
        let frame = decode_frame(&auth_token("doc", "secret")).unwrap();
        assert_eq!(
            decode_auth_reply(&frame.payload),
            Err(CodecError::UnexpectedAuthType(0))
        );
    }

    #[test]
    fn stateless_round_trip() {
        let frame = decode_frame(&stateless("doc", r#"{"kind":"cursor"}"#)).unwrap();
        assert_eq!(frame.kind, MessageKind::Stateless);
        assert_eq!(
            decode_stateless(&frame.payload).unwrap(),
            r#"{"kind":"cursor"}"#
        );
    }

    #[test]
    fn sync_status_round_trip() {
        let frame = decode_frame(&sync_status("doc", true)).unwrap();
        assert_eq!(frame.kind, MessageKind::SyncStatus);
        assert!(decode_sync_status(&frame.payload).unwrap());
        let frame = decode_frame(&sync_status("doc", false)).unwrap();
        assert!(!decode_sync_status(&frame.payload).unwrap());
    }

    #[test]
    fn peek_frame_reads_header_only() {
        let frame = awareness("notes", &[5, 5, 5]);
        let (name, kind) = peek_frame(&frame).unwrap();
        assert_eq!(name, "notes");
        assert_eq!(kind, MessageKind::Awareness);
        assert!(peek_frame(&[0x80]).is_none());
    }
}
