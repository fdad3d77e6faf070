//! The session driver: for one accepted client connection, dial upstream,
//! relay the handshake, then rewrite AMF0 commands in the client→upstream
//! direction until `publish` goes out, at which point both directions
//! degrade to blind byte copying.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::RewriteConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::rtmp::amf0;
use crate::rtmp::chunk::{self, ChunkError, ChunkHeader};
use crate::rtmp::handshake;

const INITIAL_MAX_CHUNK_SIZE: u32 = 128;

/// Terminal phase of a session. Transitions only `Rewriting -> Copying`,
/// never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Rewriting,
    Copying,
}

/// Per-connection state for the rewriting loop: the inherited chunk header,
/// the in-progress reassembly buffer, and the mutable max chunk size.
struct SessionState {
    max_chunk_size: u32,
    last_header: Option<ChunkHeader>,
    payload_buf: Vec<u8>,
    payload_filled: usize,
    phase: Phase,
}

impl SessionState {
    fn new() -> Self {
        Self {
            max_chunk_size: INITIAL_MAX_CHUNK_SIZE,
            last_header: None,
            payload_buf: Vec::new(),
            payload_filled: 0,
            phase: Phase::Rewriting,
        }
    }
}

fn map_read_err(e: std::io::Error) -> ProxyError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProxyError::Chunk(ChunkError::Truncated)
    } else {
        ProxyError::Io(e)
    }
}

/// Accept one connection: dial the configured upstream, relay the
/// handshake, then drive the session until either side closes or a
/// protocol error occurs. All failures are logged here; nothing propagates
/// past this function.
pub async fn handle_connection(mut client: TcpStream, peer_addr: SocketAddr, cfg: Arc<RewriteConfig>) {
    let span = tracing::info_span!("session", peer = %peer_addr, upstream = %cfg.upstream_addr);
    let _enter = span.enter();

    let mut upstream = match TcpStream::connect(&cfg.upstream_addr).await {
        Ok(s) => s,
        Err(e) => {
            let e = ProxyError::DialFailed(cfg.upstream_addr.clone(), e);
            tracing::warn!(error = %e, "dial upstream failed");
            return;
        }
    };

    if let Err(e) = handshake::relay_handshake(&mut client, &mut upstream).await {
        tracing::warn!(error = %e, "handshake failed");
        return;
    }
    tracing::debug!("handshake complete");

    let (client_r, client_w) = client.into_split();
    let (upstream_r, upstream_w) = upstream.into_split();

    let upstream_to_client = tokio::spawn(async move {
        let mut upstream_r = upstream_r;
        let mut client_w = client_w;
        let _ = io::copy(&mut upstream_r, &mut client_w).await;
    });

    let driver = tokio::spawn(run_session(client_r, upstream_w, cfg));

    tokio::select! {
        result = driver => {
            upstream_to_client.abort();
            match result {
                Ok(Ok(())) => tracing::debug!("session ended (client closed)"),
                Ok(Err(e)) => tracing::warn!(error = %e, "session ended"),
                Err(_) => tracing::debug!("session driver task aborted"),
            }
        }
        _ = upstream_to_client => {
            tracing::debug!("session ended (upstream closed)");
            driver.abort();
        }
    }
}

/// Run the rewriting loop on the client→upstream direction, then (once
/// `publish` has been forwarded) degrade to a blind byte copy for the rest
/// of the connection.
///
/// Generic over the stream halves so the rewriting logic can be driven in
/// tests against an in-memory duplex pair, not just a split `TcpStream`.
async fn run_session<R, W>(mut client_r: R, mut upstream_w: W, cfg: Arc<RewriteConfig>) -> ProxyResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut state = SessionState::new();

    while state.phase == Phase::Rewriting {
        let raw = chunk::read_raw_header(&mut client_r).await?;
        let header = chunk::reconstruct_header(&raw, state.last_header.as_ref());

        if state.payload_filled > 0 {
            let expected = state.last_header.expect("payload_filled > 0 implies a prior header").csid;
            if header.csid != expected {
                return Err(ProxyError::MultiStreamInterleave {
                    expected,
                    got: header.csid,
                });
            }
        }
        state.last_header = Some(header);

        if state.payload_buf.len() != header.length as usize {
            state.payload_buf = vec![0u8; header.length as usize];
            state.payload_filled = 0;
        }

        let remaining = header.length as usize - state.payload_filled;
        let to_read = remaining.min(state.max_chunk_size as usize);
        if to_read > 0 {
            let dst = &mut state.payload_buf[state.payload_filled..state.payload_filled + to_read];
            client_r.read_exact(dst).await.map_err(map_read_err)?;
        }
        state.payload_filled += to_read;

        if state.payload_filled < header.length as usize {
            continue;
        }

        let (out_payload, use_copy) = process_message(&header, &state.payload_buf, &cfg, &mut state.max_chunk_size)?;

        let framed = chunk::frame_message(&header, &out_payload, state.max_chunk_size);
        upstream_w.write_all(&framed).await?;

        state.payload_buf.clear();
        state.payload_filled = 0;

        if use_copy {
            tracing::info!("publish forwarded, degrading to copy mode");
            state.phase = Phase::Copying;
        }
    }

    io::copy(&mut client_r, &mut upstream_w).await?;
    Ok(())
}

/// Handle one complete message: update `max_chunk_size` on a set-chunk-size
/// control message, rewrite AMF0 commands, or pass everything else through
/// unchanged. Returns the payload to forward and whether the session should
/// switch to copy mode after this message.
fn process_message(
    header: &ChunkHeader,
    payload: &[u8],
    cfg: &RewriteConfig,
    max_chunk_size: &mut u32,
) -> ProxyResult<(Vec<u8>, bool)> {
    match header.typeid {
        1 => {
            if payload.len() != 4 {
                return Err(ProxyError::ProtocolViolation(
                    "set-chunk-size payload must be exactly 4 bytes".to_string(),
                ));
            }
            let value = u32::from_be_bytes(payload.try_into().unwrap());
            if value == 0 || (value as i32) < 0 {
                return Err(ProxyError::ProtocolViolation(format!(
                    "invalid chunk size {value}"
                )));
            }
            *max_chunk_size = value;
            Ok((payload.to_vec(), false))
        }
        20 => {
            let (new_payload, use_copy) = amf0::rewrite_command(payload, cfg)?;
            Ok((new_payload, use_copy))
        }
        _ => Ok((payload.to_vec(), false)),
    }
}
