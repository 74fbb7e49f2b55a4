//! NitroShare wire protocol: JSON discovery pings and length-prefixed
//! TCP packets.
//!
//! Every TCP packet is `i32` little-endian length (type byte included),
//! one type byte, then the payload. A transfer is a JSON header with
//! totals, then per item a JSON header followed by binary packets with
//! the file bytes; the receiver answers a completed transfer with one
//! success packet. The protocol has no text messages and no goodbye.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::plan::TransferPlan;
use crate::sink::{RecvEvent, TransferReport};

pub const DEFAULT_UDP_PORT: u16 = 40816;
pub const DEFAULT_TCP_PORT: u16 = 40818;

/// NitroShare peers exchange 64 KiB data packets regardless of socket
/// buffer sizing.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a single packet; anything larger is a desynced or
/// hostile stream.
const MAX_PACKET_LEN: usize = 64 * 1024 * 1024;

const TYPE_SUCCESS: u8 = 0;
const TYPE_ERROR: u8 = 1;
const TYPE_JSON: u8 = 2;
const TYPE_BINARY: u8 = 3;

// ---------------------------------------------------------------------------
// UDP discovery ping
// ---------------------------------------------------------------------------

/// Broadcast presence ping. `port` is carried as a string, matching what
/// established peers put on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ping {
    pub uuid: String,
    pub operating_system: String,
    pub port: String,
    pub uses_tls: bool,
    pub username: String,
    pub hostname: String,
}

impl Ping {
    /// Identity string in the shared `user at host (os)` form.
    pub fn signature(&self) -> String {
        format!("{} at {} ({})", self.username, self.hostname, self.operating_system)
    }

    pub fn tcp_port(&self) -> u16 {
        self.port.parse().unwrap_or(DEFAULT_TCP_PORT)
    }
}

pub fn encode_ping(ping: &Ping) -> Vec<u8> {
    serde_json::to_vec(ping).unwrap_or_default()
}

pub fn decode_ping(data: &[u8]) -> Result<Ping> {
    Ok(serde_json::from_slice(data)?)
}

// ---------------------------------------------------------------------------
// TCP packet framing
// ---------------------------------------------------------------------------

pub fn encode_packet(packet_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.extend_from_slice(&((payload.len() + 1) as i32).to_le_bytes());
    buf.push(packet_type);
    buf.extend_from_slice(payload);
    buf
}

pub fn encode_success() -> Vec<u8> {
    encode_packet(TYPE_SUCCESS, &[])
}

fn json_packet(value: &Value) -> Vec<u8> {
    encode_packet(TYPE_JSON, value.to_string().as_bytes())
}

fn transfer_header(local_name: &str, plan: &TransferPlan) -> Value {
    serde_json::json!({
        "name": local_name,
        "size": plan.total_bytes.to_string(),
        "count": plan.total_records.to_string(),
    })
}

fn item_header(rel_path: &str, directory: bool, size: i64) -> Value {
    serde_json::json!({
        "name": rel_path,
        "directory": directory,
        "created": "",
        "last_modified": "",
        "last_read": "",
        "size": size.max(0).to_string(),
    })
}

/// Stream a transfer plan as NitroShare packets.
pub async fn send_files<W, F>(
    writer: &mut W,
    plan: &TransferPlan,
    local_name: &str,
    chunk_size: usize,
    progress: &mut F,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    F: FnMut(TransferReport),
{
    writer
        .write_all(&json_packet(&transfer_header(local_name, plan)))
        .await?;

    let chunk_size = chunk_size.clamp(4096, MAX_PACKET_LEN - 1);
    let mut chunk = vec![0u8; chunk_size];
    let mut total_sent: i64 = 0;

    for entry in &plan.entries {
        writer
            .write_all(&json_packet(&item_header(
                &entry.rel_path,
                entry.is_dir(),
                entry.size,
            )))
            .await?;

        if entry.size > 0
            && let Some(path) = &entry.abs_path
        {
            let mut file = tokio::fs::File::open(path).await?;
            let mut sent_in_file: i64 = 0;
            loop {
                let n = file.read(&mut chunk).await?;
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
                writer
                    .write_all(&encode_packet(TYPE_BINARY, &chunk[..n]))
                    .await?;
            }
            if sent_in_file != entry.size {
                return Err(Error::Io(std::io::Error::other(format!(
                    "{}: size changed during send ({} != {})",
                    entry.rel_path, sent_in_file, entry.size
                ))));
            }
        }
    }

    writer.flush().await?;
    Ok(())
}

/// Wait for the receiver's closing packet. A clean close without one is
/// tolerated; an error packet fails the send.
pub async fn read_ack<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    let len = i32::from_le_bytes(head);
    if len < 1 || len as usize > MAX_PACKET_LEN {
        return Err(Error::Decode(format!("bad ack packet length {len}")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    match body[0] {
        TYPE_SUCCESS => Ok(()),
        TYPE_ERROR => Err(Error::Network(format!(
            "peer reported: {}",
            String::from_utf8_lossy(&body[1..])
        ))),
        other => Err(Error::Decode(format!("unexpected ack packet type {other}"))),
    }
}

// ---------------------------------------------------------------------------
// TCP receive state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Idle: next JSON packet is a transfer header.
    AwaitingTransferHeader,
    AwaitingItemHeader,
    ItemData,
}

/// Resumable decoder for one inbound NitroShare connection. Packet
/// boundaries never align with read boundaries, so partial packets are
/// queued until whole.
pub struct NitroDecoder {
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

impl Default for NitroDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl NitroDecoder {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingTransferHeader,
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

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::AwaitingTransferHeader && self.buf.is_empty()
    }

    pub fn feed(&mut self, data: &[u8], out: &mut Vec<RecvEvent>) -> Result<()> {
        self.buf.extend_from_slice(data);
        loop {
            if self.buf.len() < 4 {
                return Ok(());
            }
            let mut head = [0u8; 4];
            head.copy_from_slice(&self.buf[..4]);
            let len = i32::from_le_bytes(head);
            if len < 1 || len as usize > MAX_PACKET_LEN {
                return Err(Error::Decode(format!("bad packet length {len}")));
            }
            let len = len as usize;
            if self.buf.len() < 4 + len {
                return Ok(());
            }
            let packet_type = self.buf[4];
            let payload = self.buf[5..4 + len].to_vec();
            self.buf.drain(..4 + len);
            self.handle_packet(packet_type, payload, out)?;
        }
    }

    fn handle_packet(
        &mut self,
        packet_type: u8,
        payload: Vec<u8>,
        out: &mut Vec<RecvEvent>,
    ) -> Result<()> {
        match packet_type {
            TYPE_ERROR => Err(Error::Decode(format!(
                "peer aborted: {}",
                String::from_utf8_lossy(&payload)
            ))),
            TYPE_SUCCESS => Ok(()),
            TYPE_JSON => self.handle_json(&payload, out),
            TYPE_BINARY => self.handle_binary(payload, out),
            other => Err(Error::Decode(format!("unknown packet type {other}"))),
        }
    }

    fn handle_json(&mut self, payload: &[u8], out: &mut Vec<RecvEvent>) -> Result<()> {
        let value: Value = serde_json::from_slice(payload)?;
        match self.phase {
            Phase::AwaitingTransferHeader => {
                let records = int_field(&value, "count")?;
                let total = int_field(&value, "size")?;
                if records < 0 || total < 0 {
                    return Err(Error::Decode(format!(
                        "negative transfer header ({records} items, {total} bytes)"
                    )));
                }
                self.records_expected = records;
                self.records_done = 0;
                self.bytes_expected = total;
                self.bytes_done = 0;
                self.phase = Phase::AwaitingItemHeader;
                self.finish_record_if_complete(out);
                Ok(())
            }
            Phase::AwaitingItemHeader => {
                let name = str_field(&value, "name")?;
                let directory = value
                    .get("directory")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if directory {
                    out.push(RecvEvent::Directory { path: name });
                    self.records_done += 1;
                    self.finish_record_if_complete(out);
                    return Ok(());
                }
                let size = int_field(&value, "size")?;
                if size < 0 {
                    return Err(Error::Decode(format!("item \"{name}\" declares size {size}")));
                }
                out.push(RecvEvent::FileBegin {
                    path: name.clone(),
                    size,
                });
                if size == 0 {
                    out.push(RecvEvent::FileFinish { path: name });
                    self.records_done += 1;
                    self.finish_record_if_complete(out);
                } else {
                    self.path = name;
                    self.file_size = size;
                    self.file_received = 0;
                    self.phase = Phase::ItemData;
                }
                Ok(())
            }
            Phase::ItemData => Err(Error::Decode(format!(
                "JSON packet while \"{}\" still expects {} bytes",
                self.path,
                self.file_size - self.file_received
            ))),
        }
    }

    fn handle_binary(&mut self, payload: Vec<u8>, out: &mut Vec<RecvEvent>) -> Result<()> {
        if self.phase != Phase::ItemData {
            return Err(Error::Decode("binary packet outside a file record".into()));
        }
        let n = payload.len() as i64;
        if n > self.file_size - self.file_received {
            return Err(Error::Decode(format!(
                "\"{}\" overflows its declared {} bytes",
                self.path, self.file_size
            )));
        }
        self.file_received += n;
        self.bytes_done += n;
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
            data: payload,
        });
        if self.file_received == self.file_size {
            out.push(RecvEvent::FileFinish {
                path: self.path.clone(),
            });
            self.records_done += 1;
            self.phase = Phase::AwaitingItemHeader;
            self.finish_record_if_complete(out);
        }
        Ok(())
    }

    fn finish_record_if_complete(&mut self, out: &mut Vec<RecvEvent>) {
        if self.records_done == self.records_expected && self.bytes_done == self.bytes_expected {
            self.phase = Phase::AwaitingTransferHeader;
            out.push(RecvEvent::TransferComplete);
        }
    }
}

/// Integer field that may arrive as a JSON number or, as established
/// peers send it, a decimal string.
fn int_field(value: &Value, key: &str) -> Result<i64> {
    let field = value
        .get(key)
        .ok_or_else(|| Error::Decode(format!("missing field \"{key}\"")))?;
    match field {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::Decode(format!("field \"{key}\" out of range"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| Error::Decode(format!("field \"{key}\" is not an integer: {s:?}"))),
        _ => Err(Error::Decode(format!("field \"{key}\" has the wrong type"))),
    }
}

fn str_field(value: &Value, key: &str) -> Result<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Decode(format!("missing field \"{key}\"")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_length_includes_type_byte() {
        let packet = encode_packet(TYPE_JSON, b"{}");
        assert_eq!(&packet[..4], &3i32.to_le_bytes());
        assert_eq!(packet[4], TYPE_JSON);
        assert_eq!(&packet[5..], b"{}");
    }

    #[test]
    fn success_packet_is_five_bytes() {
        assert_eq!(encode_success(), vec![1, 0, 0, 0, TYPE_SUCCESS]);
    }

    #[test]
    fn ping_round_trip() {
        let ping = Ping {
            uuid: "3f0b6c2e".into(),
            operating_system: "Linux".into(),
            port: "40818".into(),
            uses_tls: false,
            username: "alice".into(),
            hostname: "ember".into(),
        };
        let decoded = decode_ping(&encode_ping(&ping)).unwrap();
        assert_eq!(decoded, ping);
        assert_eq!(decoded.signature(), "alice at ember (Linux)");
        assert_eq!(decoded.tcp_port(), 40818);
    }

    #[test]
    fn ping_with_bad_port_falls_back_to_default() {
        let mut ping = decode_ping(
            br#"{"uuid":"u","operating_system":"os","port":"x","uses_tls":true,"username":"a","hostname":"h"}"#,
        )
        .unwrap();
        assert_eq!(ping.tcp_port(), DEFAULT_TCP_PORT);
        ping.port = "9001".into();
        assert_eq!(ping.tcp_port(), 9001);
    }

    #[tokio::test]
    async fn transfer_round_trips_through_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("pack");
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("docs/readme.md"), b"# hello").unwrap();
        std::fs::write(root.join("data.bin"), vec![9u8; 70_000]).unwrap();
        let plan = TransferPlan::from_roots(&[root]).unwrap();

        let mut wire = Vec::new();
        send_files(&mut wire, &plan, "ember", CHUNK_SIZE, &mut |_| {})
            .await
            .unwrap();

        // Feed in ragged slices to exercise packet reassembly.
        let mut decoder = NitroDecoder::new();
        let mut events = Vec::new();
        for piece in wire.chunks(1237) {
            decoder.feed(piece, &mut events).unwrap();
        }

        let mut received: std::collections::HashMap<String, Vec<u8>> = Default::default();
        let mut dirs = Vec::new();
        for event in &events {
            match event {
                RecvEvent::FileChunk { report, data } => {
                    received.entry(report.path.clone()).or_default().extend(data);
                }
                RecvEvent::Directory { path } => dirs.push(path.clone()),
                _ => {}
            }
        }
        assert_eq!(dirs, vec!["pack".to_string(), "pack/docs".to_string()]);
        assert_eq!(received["pack/docs/readme.md"], b"# hello");
        assert_eq!(received["pack/data.bin"].len(), 70_000);
        assert!(matches!(events.last(), Some(RecvEvent::TransferComplete)));
        assert!(decoder.is_idle());
    }

    #[test]
    fn numeric_and_string_totals_both_decode() {
        let mut decoder = NitroDecoder::new();
        let mut out = Vec::new();
        let header = json_packet(&serde_json::json!({"name": "x", "size": 0, "count": 0}));
        decoder.feed(&header, &mut out).unwrap();
        assert_eq!(out, vec![RecvEvent::TransferComplete]);
    }

    #[test]
    fn binary_before_any_header_is_rejected() {
        let mut decoder = NitroDecoder::new();
        let err = decoder
            .feed(&encode_packet(TYPE_BINARY, b"xx"), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn oversized_chunk_for_item_is_rejected() {
        let mut decoder = NitroDecoder::new();
        let mut out = Vec::new();
        decoder
            .feed(
                &json_packet(&serde_json::json!({"name": "s", "size": "2", "count": "1"})),
                &mut out,
            )
            .unwrap();
        decoder
            .feed(
                &json_packet(&item_header("s/f.bin", false, 2)),
                &mut out,
            )
            .unwrap();
        let err = decoder
            .feed(&encode_packet(TYPE_BINARY, b"abc"), &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn error_packet_aborts_decode() {
        let mut decoder = NitroDecoder::new();
        let err = decoder
            .feed(&encode_packet(TYPE_ERROR, b"disk full"), &mut Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn zero_length_packet_is_rejected() {
        let mut decoder = NitroDecoder::new();
        let err = decoder
            .feed(&0i32.to_le_bytes(), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn ack_reader_accepts_success_and_eof() {
        let mut ok = std::io::Cursor::new(encode_success());
        read_ack(&mut ok).await.unwrap();

        let mut empty = std::io::Cursor::new(Vec::new());
        read_ack(&mut empty).await.unwrap();

        let mut refused = std::io::Cursor::new(encode_packet(TYPE_ERROR, b"no"));
        assert!(read_ack(&mut refused).await.is_err());
    }
}
