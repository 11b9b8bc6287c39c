use prometheus::IntCounter;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

const COPY_BUFFER_SIZE: usize = 32768;

/// Bidirectional byte copy between the client and the upstream.
///
/// Runs the two one-way copies concurrently and returns once both finish.
/// A read cut short by our own absolute deadline is a normal termination
/// for that direction; every other copy error is logged and the direction
/// ends. Each direction half-closes its peer's write side when its read
/// side drains. Both sockets close when the returned future resolves and
/// the streams drop.
///
/// The optional counter pair tracks client→upstream and upstream→client
/// bytes.
pub async fn splice<C, U>(
    id: &str,
    client: C,
    upstream: U,
    deadline: Instant,
    counters: Option<(IntCounter, IntCounter)>,
) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let (tx_counter, rx_counter) = match counters {
        Some((tx, rx)) => (Some(tx), Some(rx)),
        None => (None, None),
    };

    let client_to_upstream = async {
        let copied = copy_until_deadline(
            id,
            &mut client_read,
            &mut upstream_write,
            deadline,
            tx_counter,
        )
        .await;
        let _ = upstream_write.shutdown().await;
        copied
    };

    let upstream_to_client = async {
        let copied = copy_until_deadline(
            id,
            &mut upstream_read,
            &mut client_write,
            deadline,
            rx_counter,
        )
        .await;
        let _ = client_write.shutdown().await;
        copied
    };

    let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);
    debug!(id, sent, received, "splice complete");
    (sent, received)
}

async fn copy_until_deadline<R, W>(
    id: &str,
    reader: &mut R,
    writer: &mut W,
    deadline: Instant,
    counter: Option<IntCounter>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = match timeout_at(deadline, reader.read(&mut buf)).await {
            // deadline expiry on our own read is a normal termination
            Err(_) => break,
            Ok(Err(e)) => {
                if !is_benign(&e) {
                    warn!(id, error = %e, "copy read failed");
                }
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            if !is_benign(&e) {
                warn!(id, error = %e, "copy write failed");
            }
            break;
        }
        copied += n as u64;
        if let Some(counter) = &counter {
            counter.inc_by(n as u64);
        }
    }
    copied
}

/// Teardown noise that does not warrant a warning: the peer or our own
/// close raced the copy.
fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
    )
}
