//! Bidirectional data transfer between client and backend
//!
//! After the routing decision is made, non-SSH connections become plain
//! byte pipes. Each direction is copied independently; when one side
//! reaches EOF the write side of its destination is shut down so the
//! peer observes end-of-stream without losing the reverse direction.
//! This half-close behavior is what lets request/response flows finish
//! cleanly after the client stops sending.

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes in both directions until each side reaches EOF.
///
/// `initial_data` holds bytes already consumed from the client during
/// protocol detection or header parsing; it is written to the backend
/// before the client-to-backend pump starts, so the backend observes
/// the original stream byte-for-byte.
///
/// Returns `(client_to_backend, backend_to_client)` byte counts, with
/// `initial_data` included in the client-to-backend total.
pub async fn splice<C, B>(client: C, backend: B, initial_data: &[u8]) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    if !initial_data.is_empty() {
        backend_write.write_all(initial_data).await?;
    }

    let upstream = async {
        let copied = tokio::io::copy(&mut client_read, &mut backend_write).await;
        // Propagate EOS to the backend but keep reading the response
        let _ = backend_write.shutdown().await;
        copied
    };

    let downstream = async {
        let copied = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    };

    let (up, down) = tokio::join!(upstream, downstream);

    let client_to_backend = initial_data.len() as u64
        + match up {
            Ok(n) => n,
            Err(e) => {
                debug!("client->backend copy ended with error: {}", e);
                0
            }
        };
    let backend_to_client = match down {
        Ok(n) => n,
        Err(e) => {
            debug!("backend->client copy ended with error: {}", e);
            0
        }
    };

    Ok((client_to_backend, backend_to_client))
}
