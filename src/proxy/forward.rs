//! Bidirectional socket forwarding with half-close propagation.
//!
//! A session runs two independent copy directions over the split halves
//! of the client and backend sockets. A direction that reads EOF forwards
//! the FIN by shutting down its destination's send half and completes;
//! the opposite direction keeps flushing until its own EOF. A direction
//! that faults tears the session down. Shutdown terminates both
//! directions cooperatively and is not an error.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

/// Copy buffer size per direction.
pub const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// How a forwarding session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Both directions ran to orderly EOF.
    Completed {
        bytes_to_backend: u64,
        bytes_to_client: u64,
    },
    /// Shutdown was requested mid-session.
    Cancelled,
}

/// Forward bytes between a client and a backend socket until both
/// directions reach EOF, either side faults, or shutdown is signalled.
///
/// The caller closes both sockets after this returns.
pub async fn forward(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    idle_timeout: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<ForwardOutcome> {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let client_to_backend = copy_direction(&mut client_read, &mut backend_write, idle_timeout);
    let backend_to_client = copy_direction(&mut backend_read, &mut client_write, idle_timeout);
    tokio::pin!(client_to_backend);
    tokio::pin!(backend_to_client);

    // Wait for either direction to finish. A fault propagates with `?`,
    // which drops the opposite direction mid-copy. An orderly EOF has
    // already forwarded its FIN, so only the reverse direction remains.
    tokio::select! {
        result = &mut client_to_backend => {
            let bytes_to_backend = result?;
            debug!(bytes_to_backend, "client reached EOF, draining backend response");
            tokio::select! {
                result = &mut backend_to_client => Ok(ForwardOutcome::Completed {
                    bytes_to_backend,
                    bytes_to_client: result?,
                }),
                _ = shutdown.changed() => Ok(ForwardOutcome::Cancelled),
            }
        }
        result = &mut backend_to_client => {
            let bytes_to_client = result?;
            debug!(bytes_to_client, "backend reached EOF, draining client request");
            tokio::select! {
                result = &mut client_to_backend => Ok(ForwardOutcome::Completed {
                    bytes_to_backend: result?,
                    bytes_to_client,
                }),
                _ = shutdown.changed() => Ok(ForwardOutcome::Cancelled),
            }
        }
        _ = shutdown.changed() => Ok(ForwardOutcome::Cancelled),
    }
}

/// Copy from `src` to `dst` until EOF, then propagate the FIN.
async fn copy_direction(
    src: &mut ReadHalf<'_>,
    dst: &mut WriteHalf<'_>,
    idle_timeout: Option<Duration>,
) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read_result = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, src.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => src.read(&mut buf).await,
        };

        match read_result {
            Ok(0) => break,
            Ok(n) => {
                dst.write_all(&buf[..n]).await?;
                total += n as u64;
            }
            Err(e) => return Err(e),
        }
    }

    // Orderly EOF: shut down the destination's send half only, so the
    // far peer sees a clean stream end while the reverse direction keeps
    // running. The peer may have closed already; that is not a fault.
    if let Err(e) = dst.shutdown().await {
        debug!(error = %e, "send-half shutdown after EOF failed");
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) =
            tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn test_forwards_both_directions() {
        let (mut client_inner, mut client_outer) = socket_pair().await;
        let (mut backend_inner, mut backend_outer) = socket_pair().await;

        let (_tx, mut rx) = watch::channel(false);
        let session = tokio::spawn(async move {
            forward(&mut client_inner, &mut backend_inner, None, &mut rx).await
        });

        client_outer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend_outer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Close both ends so the session completes.
        drop(client_outer);
        drop(backend_outer);

        match session.await.unwrap().unwrap() {
            ForwardOutcome::Completed {
                bytes_to_backend,
                bytes_to_client,
            } => {
                assert_eq!(bytes_to_backend, 4);
                assert_eq!(bytes_to_client, 4);
            }
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_half_close_keeps_backend_direction_open() {
        let (mut client_inner, mut client_outer) = socket_pair().await;
        let (mut backend_inner, mut backend_outer) = socket_pair().await;

        let (_tx, mut rx) = watch::channel(false);
        let session = tokio::spawn(async move {
            forward(&mut client_inner, &mut backend_inner, None, &mut rx).await
        });

        // Client sends its request and half-closes immediately.
        client_outer.write_all(b"request").await.unwrap();
        client_outer.shutdown().await.unwrap();

        // Backend sees the request, then EOF.
        let mut buf = vec![0u8; 16];
        let n = backend_outer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"request");
        assert_eq!(backend_outer.read(&mut buf).await.unwrap(), 0);

        // The reverse direction must still deliver the response.
        backend_outer.write_all(b"late response").await.unwrap();
        drop(backend_outer);

        let mut response = Vec::new();
        client_outer.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"late response");

        match session.await.unwrap().unwrap() {
            ForwardOutcome::Completed {
                bytes_to_backend,
                bytes_to_client,
            } => {
                assert_eq!(bytes_to_backend, 7);
                assert_eq!(bytes_to_client, 13);
            }
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_session() {
        let (mut client_inner, _client_outer) = socket_pair().await;
        let (mut backend_inner, _backend_outer) = socket_pair().await;

        let (tx, mut rx) = watch::channel(false);
        let session = tokio::spawn(async move {
            forward(&mut client_inner, &mut backend_inner, None, &mut rx).await
        });

        tx.send(true).unwrap();

        match session.await.unwrap().unwrap() {
            ForwardOutcome::Cancelled => {}
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_timeout_surfaces_as_fault() {
        let (mut client_inner, _client_outer) = socket_pair().await;
        let (mut backend_inner, _backend_outer) = socket_pair().await;

        let (_tx, mut rx) = watch::channel(false);
        let result = forward(
            &mut client_inner,
            &mut backend_inner,
            Some(Duration::from_millis(50)),
            &mut rx,
        )
        .await;

        match result {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            Ok(other) => panic!("expected timeout error, got {:?}", other),
        }
    }
}
