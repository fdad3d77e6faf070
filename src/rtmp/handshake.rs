//! The RTMP handshake relay: a byte-exact bidirectional forward of the fixed
//! 3073-byte-per-direction handshake, with no interpretation of C0/C1/C2/
//! S0/S1/S2. The proxy does not need to participate in the handshake
//! cryptographically, so both directions are flattened into one bulk copy
//! each.

use thiserror::Error;
use tokio::io::{copy, AsyncReadExt};
use tokio::net::TcpStream;

/// `1 (C0/S0) + 1536 (C1/S1) + 1536 (C2/S2)`.
const HANDSHAKE_BYTES: u64 = 1 + 1536 + 1536;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake ended early: got {0} of {HANDSHAKE_BYTES} expected bytes")]
    Truncated(u64),
}

/// Forward exactly `HANDSHAKE_BYTES` from `client` to `upstream` and
/// simultaneously `HANDSHAKE_BYTES` from `upstream` to `client`. Succeeds
/// only once both directions have copied the full count; any error or short
/// copy on either side fails the whole relay.
pub async fn relay_handshake(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
) -> Result<(), HandshakeError> {
    let (mut client_r, mut client_w) = client.split();
    let (mut upstream_r, mut upstream_w) = upstream.split();

    let to_upstream = copy(&mut (&mut client_r).take(HANDSHAKE_BYTES), &mut upstream_w);
    let to_client = copy(&mut (&mut upstream_r).take(HANDSHAKE_BYTES), &mut client_w);

    let (sent, received) = tokio::try_join!(to_upstream, to_client)?;

    if sent != HANDSHAKE_BYTES {
        return Err(HandshakeError::Truncated(sent));
    }
    if received != HANDSHAKE_BYTES {
        return Err(HandshakeError::Truncated(received));
    }
    Ok(())
}
