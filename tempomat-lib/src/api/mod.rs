//! Introspection RPC: a read-only window into live bucket state.
//!
//! One procedure, `TempomatAPI.Dump`, served over loopback TCP on port
//! 29999. Messages are 4-byte big-endian length-prefixed JSON frames;
//! the bundled client ([`client::Client`]) and the `tempomat-doctor`
//! CLI speak the same framing. The endpoint is unauthenticated and
//! intended for co-located operator tools only.

mod client;
mod server;

pub use client::Client;
pub use server::serve;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default listen address for the introspection server.
pub const DEFAULT_ADDR: &str = "127.0.0.1:29999";

/// The only procedure the endpoint serves.
pub const DUMP_METHOD: &str = "TempomatAPI.Dump";

/// Frames larger than this are junk, not requests.
const MAX_FRAME_LEN: usize = 1 << 20;

/// One request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DumpRequest {
    pub method: String,
    pub bucket_name: String,
}

/// One bucket entry as exposed on the wire. Times and durations are
/// plain seconds (`LastUsed` since the Unix epoch).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DumpEntry {
    pub hash: String,
    pub title: String,
    pub last_used: f64,
    pub avg_wait: f64,
    pub avg_cpu_secs: f64,
    pub avg_since_prev: f64,
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed
/// the connection cleanly at a frame boundary.
async fn read_frame<S>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}
