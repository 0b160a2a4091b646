//! Socket pump tasks shared by both engines.
//!
//! All engine state lives in a single reactor task; sockets that must be
//! read concurrently get a small pump task instead that forwards bytes into
//! the reactor over mpsc. A pump never touches engine state.

use crate::codec::decode_frame;
use crate::net::announcer::Announcer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Read length-prefixed frames off a TCP stream and forward each payload,
/// tagged with `key`, into the reactor. A final `None` reports that the
/// stream closed or failed, so the reactor can drop its half.
pub(crate) fn spawn_frame_reader<K>(
    mut reader: OwnedReadHalf,
    key: K,
    tx: mpsc::Sender<(K, Option<Vec<u8>>)>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    K: Clone + Send + 'static,
{
    tokio::spawn(async move {
        let mut acc: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        'read: loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                read = reader.read(&mut chunk) => match read {
                    Ok(0) | Err(_) => break 'read,
                    Ok(n) => {
                        acc.extend_from_slice(&chunk[..n]);
                        loop {
                            // Truncated means wait for more bytes.
                            let (payload, consumed) = match decode_frame(&acc) {
                                Ok((payload, consumed)) => (payload.to_vec(), consumed),
                                Err(_) => break,
                            };
                            acc.drain(..consumed);
                            if tx.send((key.clone(), Some(payload))).await.is_err() {
                                return;
                            }
                        }
                    }
                },
            }
        }
        let _ = tx.send((key, None)).await;
    })
}

/// Forward every received datagram, with its source address, into the
/// reactor.
pub(crate) fn spawn_udp_pump(
    announcer: Arc<Announcer>,
    tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = announcer.recv_from(&mut buf) => match result {
                    Ok((len, src)) => {
                        if tx.send((buf[..len].to_vec(), src)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("udp receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    })
}

/// Write one frame with the protocol's short send bound. A slow or dead
/// receiver costs at most `waiting`; the caller treats failure as losing
/// that one recipient.
pub(crate) async fn send_frame(
    writer: &mut OwnedWriteHalf,
    frame: &[u8],
    waiting: Duration,
) -> std::io::Result<()> {
    match timeout(waiting, writer.write_all(frame)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "send timed out",
        )),
    }
}
