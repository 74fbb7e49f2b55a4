use crate::peer::Peer;

/// Progress counters attached to every chunk callback, identical in
/// shape on the send and receive sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Relative path of the record the chunk belongs to.
    pub path: String,
    /// Bytes of this record transferred so far.
    pub bytes_in_file: i64,
    /// Declared size of this record (`-1` for directories).
    pub file_size: i64,
    /// Bytes of the whole transfer moved so far.
    pub bytes_total: i64,
    /// Declared total of the whole transfer.
    pub total_size: i64,
}

/// One decoded step of an inbound byte stream.
///
/// Both codecs produce this same event stream, so the receive side of the
/// engine is protocol-agnostic above the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvEvent {
    /// A directory record; no data phase follows.
    Directory { path: String },
    /// A file record is about to stream `size` bytes.
    FileBegin { path: String, size: i64 },
    FileChunk { report: TransferReport, data: Vec<u8> },
    FileFinish { path: String },
    /// Every record arrived and every declared byte was consumed.
    TransferComplete,
}

/// The interface the engine requires from its host application.
///
/// All methods default to no-ops so a host only implements what it
/// renders. Peer events arrive serialized per protocol; progress events
/// for one transfer arrive from that transfer's worker only, so handlers
/// need not be reentrant.
#[allow(unused_variables)]
pub trait EventSink: Send + Sync {
    fn on_peer_added(&self, peer: &Peer) {}
    fn on_peer_removed(&self, peer: &Peer) {}

    fn on_recv_file_begin(&self, path: &str, size: i64) {}
    fn on_recv_file_chunk(&self, report: &TransferReport, chunk: &[u8]) {}
    fn on_recv_file_finish(&self, path: &str) {}
    fn on_recv_text(&self, text: &str) {}

    fn on_send_file_chunk(&self, report: &TransferReport) {}
    fn on_send_finish(&self) {}

    /// An inbound connection ran to completion and closed.
    fn on_request_finish(&self) {}
}

/// Sink that ignores everything; useful as a default and in tests.
pub struct NullSink;

impl EventSink for NullSink {}
