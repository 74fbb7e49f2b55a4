//! Dukto wire protocol: UDP presence frames and the framed TCP stream.
//!
//! All integers on the wire are little-endian and signed. The TCP side is
//! a header (`i64` record count, `i64` total bytes) followed by records of
//! NUL-terminated path, `i64` size and raw bytes; directories carry size
//! `-1` and no bytes. A text message is a single record whose path is the
//! `TEXT_TAG` sentinel.

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::plan::{DIR_SIZE, TransferPlan};
use crate::sink::{RecvEvent, TransferReport};

pub const DEFAULT_UDP_PORT: u16 = 4644;
pub const DEFAULT_TCP_PORT: u16 = 4644;

/// Path sentinel routing a record's bytes to the text sink instead of
/// the filesystem.
pub const TEXT_TAG: &str = "___DUKTO___TEXT___";

const OPCODE_HELLO_BROADCAST: u8 = 0x01;
const OPCODE_HELLO_UNICAST: u8 = 0x02;
const OPCODE_GOODBYE: u8 = 0x03;
const OPCODE_HELLO_PORT_BROADCAST: u8 = 0x04;
const OPCODE_HELLO_PORT_UNICAST: u8 = 0x05;

const GOODBYE_PAYLOAD: &[u8] = b"Bye Bye";

// ---------------------------------------------------------------------------
// UDP discovery frames
// ---------------------------------------------------------------------------

/// A parsed discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpFrame {
    Hello {
        /// TCP port the sender accepts transfers on.
        port: u16,
        signature: String,
        /// Whether the frame was a broadcast flavor (0x01/0x04), which
        /// asks for a unicast reply.
        broadcast: bool,
    },
    Goodbye,
}

/// Encode a hello. The compact opcodes 0x01/0x02 imply the default TCP
/// port; any other port uses 0x04/0x05 with an explicit `i16`.
pub fn encode_hello(signature: &str, tcp_port: u16, broadcast: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + signature.len());
    if tcp_port == DEFAULT_TCP_PORT {
        buf.push(if broadcast {
            OPCODE_HELLO_BROADCAST
        } else {
            OPCODE_HELLO_UNICAST
        });
    } else {
        buf.push(if broadcast {
            OPCODE_HELLO_PORT_BROADCAST
        } else {
            OPCODE_HELLO_PORT_UNICAST
        });
        buf.extend_from_slice(&(tcp_port as i16).to_le_bytes());
    }
    buf.extend_from_slice(signature.as_bytes());
    buf
}

pub fn encode_goodbye() -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + GOODBYE_PAYLOAD.len());
    buf.push(OPCODE_GOODBYE);
    buf.extend_from_slice(GOODBYE_PAYLOAD);
    buf
}

pub fn decode_udp(data: &[u8]) -> Result<UdpFrame> {
    let (&opcode, rest) = data
        .split_first()
        .ok_or_else(|| Error::Decode("empty discovery datagram".into()))?;
    match opcode {
        OPCODE_GOODBYE => Ok(UdpFrame::Goodbye),
        OPCODE_HELLO_BROADCAST | OPCODE_HELLO_UNICAST => Ok(UdpFrame::Hello {
            port: DEFAULT_TCP_PORT,
            signature: String::from_utf8(rest.to_vec())?,
            broadcast: opcode == OPCODE_HELLO_BROADCAST,
        }),
        OPCODE_HELLO_PORT_BROADCAST | OPCODE_HELLO_PORT_UNICAST => {
            if rest.len() < 2 {
                return Err(Error::Decode("hello frame truncated before port".into()));
            }
            let port = i16::from_le_bytes([rest[0], rest[1]]) as u16;
            Ok(UdpFrame::Hello {
                port,
                signature: String::from_utf8(rest[2..].to_vec())?,
                broadcast: opcode == OPCODE_HELLO_PORT_BROADCAST,
            })
        }
        other => Err(Error::Decode(format!(
            "unknown discovery opcode 0x{other:02x}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// TCP encoding
// ---------------------------------------------------------------------------

/// Transfer header: record count then total payload bytes.
pub fn encode_header(records: i64, total_bytes: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&records.to_le_bytes());
    buf.extend_from_slice(&total_bytes.to_le_bytes());
    buf
}

/// A complete text transfer: one record tagged with [`TEXT_TAG`].
pub fn encode_text(text: &str) -> Vec<u8> {
    let payload = text.as_bytes();
    let size = payload.len() as i64;
    let mut buf = encode_header(1, size);
    buf.extend_from_slice(TEXT_TAG.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Stream a transfer plan into `writer`.
///
/// File bytes are read in chunks and accumulated into outbound writes of
/// at most `chunk_size` bytes; a batch is flushed once it exceeds
/// `chunk_size - 1024` so record headers piggyback on data writes.
/// `progress` fires once per chunk read from disk.
pub async fn send_files<W, F>(
    writer: &mut W,
    plan: &TransferPlan,
    chunk_size: usize,
    progress: &mut F,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    F: FnMut(TransferReport),
{
    writer
        .write_all(&encode_header(plan.total_records, plan.total_bytes))
        .await?;

    let chunk_size = chunk_size.max(4096);
    let flush_at = chunk_size - 1024;
    let mut batch: Vec<u8> = Vec::with_capacity(chunk_size);
    let mut chunk = vec![0u8; chunk_size];
    let mut total_sent: i64 = 0;

    for entry in &plan.entries {
        batch.extend_from_slice(entry.rel_path.as_bytes());
        batch.push(0);
        batch.extend_from_slice(&entry.size.to_le_bytes());
        if batch.len() > flush_at {
            writer.write_all(&batch).await?;
            batch.clear();
        }

        if entry.size > 0
            && let Some(path) = &entry.abs_path
        {
            let mut file = tokio::fs::File::open(path).await?;
            let mut sent_in_file: i64 = 0;
            loop {
                let want = (chunk_size - batch.len()).min(chunk.len());
                let n = file.read(&mut chunk[..want]).await?;
                if n == 0 {
                    break;
                }
                sent_in_file += n as i64;
                total_sent += n as i64;
                progress(TransferReport {
                    path: entry.rel_path.clone(),
                    bytes_in_file: sent_in_file,
                    file_size: entry.size,
                    bytes_total: total_sent,
                    total_size: plan.total_bytes,
                });
                batch.extend_from_slice(&chunk[..n]);
                if batch.len() > flush_at {
                    writer.write_all(&batch).await?;
                    batch.clear();
                }
            }
            if sent_in_file != entry.size {
                return Err(Error::Io(std::io::Error::other(format!(
                    "{}: size changed during send ({} != {})",
                    entry.rel_path, sent_in_file, entry.size
                ))));
            }
        }
    }

    if !batch.is_empty() {
        writer.write_all(&batch).await?;
    }
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// TCP receive state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingName,
    AwaitingSize,
    StreamingData,
}

/// Resumable decoder for one inbound Dukto connection.
///
/// Bytes are queued internally, so a single `feed` may carry several
/// records or split any field at an arbitrary boundary. Events already
/// decoded survive a later error in the same call; a decode error
/// abandons the machine (the caller drops the connection).
pub struct DuktoDecoder {
    phase: Phase,
    buf: Vec<u8>,
    records_expected: i64,
    records_done: i64,
    bytes_expected: i64,
    bytes_done: i64,
    path: String,
    file_size: i64,
    file_received: i64,
}

impl Default for DuktoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DuktoDecoder {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            buf: Vec::new(),
            records_expected: 0,
            records_done: 0,
            bytes_expected: 0,
            bytes_done: 0,
            path: String::new(),
            file_size: 0,
            file_received: 0,
        }
    }

    /// True when no transfer is in flight and no bytes are queued; EOF
    /// here is a normal end-of-stream.
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle && self.buf.is_empty()
    }

    /// Consume `data`, appending decoded events to `out`.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<RecvEvent>) -> Result<()> {
        self.buf.extend_from_slice(data);
        loop {
            match self.phase {
                Phase::Idle => {
                    if self.buf.len() < 16 {
                        return Ok(());
                    }
                    let records = self.take_i64();
                    let total = self.take_i64();
                    if records < 0 || total < 0 {
                        return Err(Error::Decode(format!(
                            "negative transfer header ({records} records, {total} bytes)"
                        )));
                    }
                    self.records_expected = records;
                    self.records_done = 0;
                    self.bytes_expected = total;
                    self.bytes_done = 0;
                    self.phase = Phase::AwaitingName;
                    self.finish_record_if_complete(out)?;
                }
                Phase::AwaitingName => {
                    let Some(pos) = self.buf.iter().position(|&b| b == 0) else {
                        return Ok(());
                    };
                    let name = self.buf[..pos].to_vec();
                    self.buf.drain(..=pos);
                    self.path = String::from_utf8(name)?;
                    self.phase = Phase::AwaitingSize;
                }
                Phase::AwaitingSize => {
                    if self.buf.len() < 8 {
                        return Ok(());
                    }
                    let size = self.take_i64();
                    if size < DIR_SIZE {
                        return Err(Error::Decode(format!(
                            "record \"{}\" declares size {size}",
                            self.path
                        )));
                    }
                    if size == DIR_SIZE {
                        out.push(RecvEvent::Directory {
                            path: self.path.clone(),
                        });
                        self.records_done += 1;
                        self.phase = Phase::AwaitingName;
                        self.finish_record_if_complete(out)?;
                    } else if size == 0 {
                        out.push(RecvEvent::FileBegin {
                            path: self.path.clone(),
                            size: 0,
                        });
                        out.push(RecvEvent::FileFinish {
                            path: self.path.clone(),
                        });
                        self.records_done += 1;
                        self.phase = Phase::AwaitingName;
                        self.finish_record_if_complete(out)?;
                    } else {
                        out.push(RecvEvent::FileBegin {
                            path: self.path.clone(),
                            size,
                        });
                        self.file_size = size;
                        self.file_received = 0;
                        self.phase = Phase::StreamingData;
                    }
                }
                Phase::StreamingData => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    let want = (self.file_size - self.file_received) as usize;
                    let n = want.min(self.buf.len());
                    let data: Vec<u8> = self.buf.drain(..n).collect();
                    self.file_received += n as i64;
                    self.bytes_done += n as i64;
                    if self.bytes_done > self.bytes_expected {
                        return Err(Error::Decode(format!(
                            "payload exceeds declared total of {} bytes",
                            self.bytes_expected
                        )));
                    }
                    out.push(RecvEvent::FileChunk {
                        report: TransferReport {
                            path: self.path.clone(),
                            bytes_in_file: self.file_received,
                            file_size: self.file_size,
                            bytes_total: self.bytes_done,
                            total_size: self.bytes_expected,
                        },
                        data,
                    });
                    if self.file_received == self.file_size {
                        out.push(RecvEvent::FileFinish {
                            path: self.path.clone(),
                        });
                        self.records_done += 1;
                        self.phase = Phase::AwaitingName;
                        self.finish_record_if_complete(out)?;
                    }
                }
            }
        }
    }

    /// After a record boundary: arm the next record, or return to idle
    /// once both counters are satisfied. Bytes still queued at that
    /// point exceed the declared total and surface as a decode error;
    /// some senders pad their final write, which a caller will see
    /// logged against this connection.
    fn finish_record_if_complete(&mut self, out: &mut Vec<RecvEvent>) -> Result<()> {
        if self.records_done == self.records_expected && self.bytes_done == self.bytes_expected {
            self.phase = Phase::Idle;
            out.push(RecvEvent::TransferComplete);
            if !self.buf.is_empty() {
                return Err(Error::Decode(format!(
                    "{} trailing bytes after completed transfer",
                    self.buf.len()
                )));
            }
        }
        Ok(())
    }

    fn take_i64(&mut self) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[..8]);
        self.buf.drain(..8);
        i64::from_le_bytes(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut DuktoDecoder, bytes: &[u8]) -> Vec<RecvEvent> {
        let mut out = Vec::new();
        decoder.feed(bytes, &mut out).unwrap();
        out
    }

    #[test]
    fn text_hi_matches_reference_bytes() {
        let bytes = encode_text("hi");
        let mut expected = Vec::new();
        expected.extend_from_slice(&1i64.to_le_bytes());
        expected.extend_from_slice(&2i64.to_le_bytes());
        expected.extend_from_slice(b"___DUKTO___TEXT___\0");
        expected.extend_from_slice(&2i64.to_le_bytes());
        expected.extend_from_slice(b"hi");
        assert_eq!(bytes, expected);

        let mut decoder = DuktoDecoder::new();
        let events = drain(&mut decoder, &bytes);
        assert_eq!(
            events,
            vec![
                RecvEvent::FileBegin {
                    path: TEXT_TAG.into(),
                    size: 2
                },
                RecvEvent::FileChunk {
                    report: TransferReport {
                        path: TEXT_TAG.into(),
                        bytes_in_file: 2,
                        file_size: 2,
                        bytes_total: 2,
                        total_size: 2,
                    },
                    data: b"hi".to_vec(),
                },
                RecvEvent::FileFinish {
                    path: TEXT_TAG.into()
                },
                RecvEvent::TransferComplete,
            ]
        );
        assert!(decoder.is_idle());
    }

    #[test]
    fn single_empty_directory() {
        let mut wire = encode_header(1, 0);
        wire.extend_from_slice(b"d\0");
        wire.extend_from_slice(&(-1i64).to_le_bytes());

        let mut decoder = DuktoDecoder::new();
        let events = drain(&mut decoder, &wire);
        assert_eq!(
            events,
            vec![
                RecvEvent::Directory { path: "d".into() },
                RecvEvent::TransferComplete,
            ]
        );
        assert!(decoder.is_idle());
    }

    #[test]
    fn three_byte_file() {
        let mut wire = encode_header(1, 3);
        wire.extend_from_slice(b"a.txt\0");
        wire.extend_from_slice(&3i64.to_le_bytes());
        wire.extend_from_slice(b"ABC");

        let mut decoder = DuktoDecoder::new();
        let events = drain(&mut decoder, &wire);
        let chunks: Vec<&[u8]> = events
            .iter()
            .filter_map(|e| match e {
                RecvEvent::FileChunk { data, .. } => Some(data.as_slice()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![b"ABC".as_slice()]);
        assert!(matches!(events.last(), Some(RecvEvent::TransferComplete)));
    }

    #[test]
    fn one_byte_segments_yield_identical_events() {
        let mut wire = encode_header(2, 4);
        wire.extend_from_slice(b"x/y.bin\0");
        wire.extend_from_slice(&4i64.to_le_bytes());
        wire.extend_from_slice(&[1, 2, 3, 4]);
        wire.extend_from_slice(b"x\0");
        wire.extend_from_slice(&(-1i64).to_le_bytes());

        let mut whole = DuktoDecoder::new();
        let whole_events = drain(&mut whole, &wire);

        let mut split = DuktoDecoder::new();
        let mut split_events = Vec::new();
        for byte in &wire {
            split.feed(std::slice::from_ref(byte), &mut split_events).unwrap();
        }

        // Chunk boundaries differ (byte-at-a-time yields 1-byte chunks),
        // but the reassembled payload and the event skeleton must match.
        let reassemble = |events: &[RecvEvent]| {
            events
                .iter()
                .filter_map(|e| match e {
                    RecvEvent::FileChunk { data, .. } => Some(data.clone()),
                    _ => None,
                })
                .flatten()
                .collect::<Vec<u8>>()
        };
        let skeleton = |events: &[RecvEvent]| {
            events
                .iter()
                .filter(|e| !matches!(e, RecvEvent::FileChunk { .. }))
                .cloned()
                .collect::<Vec<_>>()
        };
        assert_eq!(reassemble(&whole_events), reassemble(&split_events));
        assert_eq!(skeleton(&whole_events), skeleton(&split_events));
        assert!(whole.is_idle() && split.is_idle());
    }

    #[test]
    fn interleaved_chunk_sizes_reconstruct_payload() {
        let payload: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
        let mut wire = encode_header(1, payload.len() as i64);
        wire.extend_from_slice(b"big.bin\0");
        wire.extend_from_slice(&(payload.len() as i64).to_le_bytes());
        wire.extend_from_slice(&payload);

        let mut decoder = DuktoDecoder::new();
        let mut events = Vec::new();
        let mut offset: usize = 0;
        for len in [1usize, 5, 4096, usize::MAX] {
            let end = offset.saturating_add(len).min(wire.len());
            decoder.feed(&wire[offset..end], &mut events).unwrap();
            offset = end;
        }
        let received: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                RecvEvent::FileChunk { data, .. } => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(received, payload);
        assert!(matches!(events.last(), Some(RecvEvent::TransferComplete)));
    }

    #[test]
    fn zero_byte_file_finishes_without_chunks() {
        let mut wire = encode_header(1, 0);
        wire.extend_from_slice(b"empty\0");
        wire.extend_from_slice(&0i64.to_le_bytes());

        let mut decoder = DuktoDecoder::new();
        let events = drain(&mut decoder, &wire);
        assert_eq!(
            events,
            vec![
                RecvEvent::FileBegin {
                    path: "empty".into(),
                    size: 0
                },
                RecvEvent::FileFinish {
                    path: "empty".into()
                },
                RecvEvent::TransferComplete,
            ]
        );
    }

    #[test]
    fn unicode_path_is_not_normalized() {
        // "é" in NFD (e + combining acute) must survive byte-for-byte.
        let path = "caf\u{0065}\u{0301}.txt";
        let mut wire = encode_header(1, 1);
        wire.extend_from_slice(path.as_bytes());
        wire.push(0);
        wire.extend_from_slice(&1i64.to_le_bytes());
        wire.push(b'!');

        let mut decoder = DuktoDecoder::new();
        let events = drain(&mut decoder, &wire);
        match &events[0] {
            RecvEvent::FileBegin { path: got, .. } => assert_eq!(got, path),
            other => panic!("expected FileBegin, got {other:?}"),
        }
    }

    #[test]
    fn trailing_bytes_after_completion_are_a_decode_error() {
        let mut wire = encode_text("hi");
        wire.extend_from_slice(b"junk");

        let mut decoder = DuktoDecoder::new();
        let mut events = Vec::new();
        let err = decoder.feed(&wire, &mut events).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        // The completed transfer was still fully surfaced.
        assert!(events.contains(&RecvEvent::TransferComplete));
    }

    #[test]
    fn negative_header_is_rejected() {
        let wire = encode_header(-1, 0);
        let mut decoder = DuktoDecoder::new();
        assert!(decoder.feed(&wire, &mut Vec::new()).is_err());
    }

    #[test]
    fn undersized_record_size_is_rejected() {
        let mut wire = encode_header(1, 0);
        wire.extend_from_slice(b"f\0");
        wire.extend_from_slice(&(-2i64).to_le_bytes());
        let mut decoder = DuktoDecoder::new();
        assert!(decoder.feed(&wire, &mut Vec::new()).is_err());
    }

    #[test]
    fn hello_round_trips_default_port() {
        let sig = "alice at ember (Linux)";
        let wire = encode_hello(sig, DEFAULT_TCP_PORT, true);
        assert_eq!(wire[0], 0x01);
        assert_eq!(
            decode_udp(&wire).unwrap(),
            UdpFrame::Hello {
                port: 4644,
                signature: sig.into(),
                broadcast: true,
            }
        );
    }

    #[test]
    fn hello_with_explicit_port_9999() {
        let sig = "bob at oak (Windows)";
        let wire = encode_hello(sig, 9999, true);
        assert_eq!(wire[0], 0x04);
        assert_eq!(&wire[1..3], &9999i16.to_le_bytes());
        match decode_udp(&wire).unwrap() {
            UdpFrame::Hello { port, .. } => assert_eq!(port, 9999),
            other => panic!("expected hello, got {other:?}"),
        }

        let unicast = encode_hello(sig, 9999, false);
        assert_eq!(unicast[0], 0x05);
        match decode_udp(&unicast).unwrap() {
            UdpFrame::Hello { broadcast, .. } => assert!(!broadcast),
            other => panic!("expected hello, got {other:?}"),
        }
    }

    #[test]
    fn goodbye_round_trip() {
        let wire = encode_goodbye();
        assert_eq!(wire, b"\x03Bye Bye");
        assert_eq!(decode_udp(&wire).unwrap(), UdpFrame::Goodbye);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(decode_udp(&[0x7f, 1, 2]).is_err());
        assert!(decode_udp(&[]).is_err());
    }

    #[tokio::test]
    async fn plan_round_trips_through_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("out");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("sub/b.txt"), b"bravo!").unwrap();
        let plan = TransferPlan::from_roots(&[root]).unwrap();

        let mut wire = Vec::new();
        send_files(&mut wire, &plan, 8192, &mut |_| {}).await.unwrap();

        let mut decoder = DuktoDecoder::new();
        let mut events = Vec::new();
        decoder.feed(&wire, &mut events).unwrap();

        let mut finishes = 0;
        let mut received: std::collections::HashMap<String, Vec<u8>> = Default::default();
        for event in &events {
            match event {
                RecvEvent::FileChunk { report, data } => {
                    received.entry(report.path.clone()).or_default().extend(data);
                }
                RecvEvent::FileFinish { .. } => finishes += 1,
                _ => {}
            }
        }
        assert_eq!(finishes, 2);
        assert_eq!(received["out/a.txt"], b"alpha");
        assert_eq!(received["out/sub/b.txt"], b"bravo!");
        assert!(decoder.is_idle());
    }

    #[tokio::test]
    async fn send_progress_totals_match_plan() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.bin");
        std::fs::write(&file, vec![7u8; 100_000]).unwrap();
        let plan = TransferPlan::from_roots(&[file]).unwrap();

        let mut wire = Vec::new();
        let mut last = None;
        send_files(&mut wire, &plan, 8192, &mut |r| last = Some(r))
            .await
            .unwrap();

        let last = last.unwrap();
        assert_eq!(last.bytes_in_file, 100_000);
        assert_eq!(last.bytes_total, 100_000);
        assert_eq!(last.total_size, plan.total_bytes);
    }
}
