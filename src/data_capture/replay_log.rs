//! Binary framing of the replay log.
//!
//! Every captured chunk is stored as one self-delimiting frame:
//!
//! ```text
//! +----------------+--------------------------------------------+-------------+---------+
//! | u64 BE         | ASCII "<clientIP>:<port> <serverIP>:<port> "| u32 BE      | payload |
//! | ns since epoch | (each address followed by one space)        | payload len | bytes   |
//! +----------------+--------------------------------------------+-------------+---------+
//! ```
//!
//! There is no trailing delimiter; frames follow each other directly. IPv6
//! addresses use the bracketed `[addr]:port` form.

use std::io;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, SecondsFormat};
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

use crate::error_handling::types::CaptureError;

use super::types::{CaptureEntry, ConnectionId};

const TIMESTAMP_LEN: usize = 8;
const LENGTH_LEN: usize = 4;
/// Longest address field accepted by the decoder, separator included.
const MAX_ADDR_LEN: usize = 128;

/// `tokio_util` codec for replay log frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayLogCodec;

impl Encoder<CaptureEntry> for ReplayLogCodec {
    type Error = CaptureError;

    fn encode(&mut self, entry: CaptureEntry, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let nanos = entry
            .timestamp()
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| {
                CaptureError::Encode(format!(
                    "timestamp {} is outside the representable range",
                    entry.timestamp()
                ))
            })?;
        let payload = entry.payload();
        let len = u32::try_from(payload.len()).map_err(|_| {
            CaptureError::Encode(format!("payload of {} bytes is too large", payload.len()))
        })?;
        let addrs = format!("{} {} ", entry.connection().client, entry.connection().server);

        dst.reserve(TIMESTAMP_LEN + addrs.len() + LENGTH_LEN + payload.len());
        dst.put_u64(nanos);
        dst.put_slice(addrs.as_bytes());
        dst.put_u32(len);
        dst.put_slice(payload);
        Ok(())
    }
}

impl Decoder for ReplayLogCodec {
    type Item = CaptureEntry;
    type Error = CaptureError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < TIMESTAMP_LEN {
            return Ok(None);
        }
        let client_start = TIMESTAMP_LEN;
        let client_len = match addr_field_len(&src[client_start..])? {
            Some(len) => len,
            None => return Ok(None),
        };
        let server_start = client_start + client_len;
        let server_len = match addr_field_len(&src[server_start..])? {
            Some(len) => len,
            None => return Ok(None),
        };
        let len_start = server_start + server_len;
        if src.len() < len_start + LENGTH_LEN {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LENGTH_LEN];
        len_bytes.copy_from_slice(&src[len_start..len_start + LENGTH_LEN]);
        let frame_len = len_start + LENGTH_LEN + u32::from_be_bytes(len_bytes) as usize;

        if src.len() < frame_len {
            // The whole payload has not been read yet.
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        let nanos = i64::try_from(frame.get_u64())
            .map_err(|_| CaptureError::Decode("timestamp out of range".to_string()))?;
        let client = parse_addr(&frame.split_to(client_len))?;
        let server = parse_addr(&frame.split_to(server_len))?;
        frame.advance(LENGTH_LEN);

        Ok(Some(CaptureEntry::from_parts(
            DateTime::from_timestamp_nanos(nanos),
            ConnectionId::new(client, server),
            frame.to_vec(),
        )))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(entry) => Ok(Some(entry)),
            None if buf.is_empty() => Ok(None),
            None => Err(unexpected_eof()),
        }
    }
}

/// Length of the address field at the start of `buf`, separator included,
/// or `None` while the separator has not arrived.
fn addr_field_len(buf: &[u8]) -> Result<Option<usize>, CaptureError> {
    let window = &buf[..buf.len().min(MAX_ADDR_LEN)];
    match window.iter().position(|&b| b == b' ') {
        Some(pos) => Ok(Some(pos + 1)),
        None if buf.len() < MAX_ADDR_LEN => Ok(None),
        None => Err(CaptureError::Decode(
            "address field is not terminated".to_string(),
        )),
    }
}

fn parse_addr(field: &[u8]) -> Result<SocketAddr, CaptureError> {
    let field = &field[..field.len() - 1];
    let text = std::str::from_utf8(field)
        .map_err(|e| CaptureError::Decode(format!("address is not ASCII: {}", e)))?;
    text.parse()
        .map_err(|e| CaptureError::Decode(format!("invalid address {:?}: {}", text, e)))
}

/// Streams entries back out of a replay log.
pub struct ReplayLogReader<R> {
    frames: FramedRead<R, ReplayLogCodec>,
}

impl<R: AsyncRead + Unpin> ReplayLogReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            frames: FramedRead::new(reader, ReplayLogCodec),
        }
    }

    /// Decodes the next frame.
    ///
    /// Returns `Ok(None)` when the input ends cleanly between two frames. An
    /// input ending inside a frame is an `UnexpectedEof` IO error.
    pub async fn next_entry(&mut self) -> Result<Option<CaptureEntry>, CaptureError> {
        self.frames.next().await.transpose()
    }

    /// Reads every remaining entry.
    pub async fn read_all(&mut self) -> Result<Vec<CaptureEntry>, CaptureError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry().await? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// One-line human summary of an entry, as printed by `inspect`.
pub fn describe_entry(index: usize, entry: &CaptureEntry) -> String {
    format!(
        "{}: Timestamp={}, Client={}, Server={}, len(Chunk)={}",
        index,
        entry.timestamp().to_rfc3339_opts(SecondsFormat::Nanos, true),
        entry.connection().client,
        entry.connection().server,
        entry.payload().len()
    )
}

fn unexpected_eof() -> CaptureError {
    CaptureError::IoError(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "replay log ends in the middle of a frame",
    ))
}
