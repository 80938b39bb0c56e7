use std::io;
use std::sync::Arc;

use subproc_protocol::OutputStream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::supervisor::{ChildEvent, EntryId};

/// Relays one forwarded stream: every non-empty read becomes exactly one
/// `Output` event, end-of-file becomes `StreamClosed`. The read end is owned
/// by this task and closed when it finishes.
///
/// Each read spends one permit of `credit`, which the entry's status writer
/// returns once the message is written. A closed `credit` means nobody is
/// writing any more and the stream is drained freely.
pub fn spawn_forwarder<R>(
    id: EntryId,
    stream: OutputStream,
    reader: R,
    chunk: usize,
    credit: Arc<Semaphore>,
    events: UnboundedSender<ChildEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(forward(id, stream, reader, chunk, credit, events));
}

async fn forward<R>(
    id: EntryId,
    stream: OutputStream,
    mut reader: R,
    chunk: usize,
    credit: Arc<Semaphore>,
    events: UnboundedSender<ChildEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk];
    loop {
        if let Ok(permit) = credit.acquire().await {
            permit.forget();
        }
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let event = ChildEvent::Output {
                    id,
                    stream,
                    bytes: buf[..n].to_vec(),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(stream = stream.as_str(), "Read from child pipe failed: {}", err);
                break;
            }
        }
    }
    debug!(stream = stream.as_str(), "Forwarded stream reached end-of-file");
    let _ = events.send(ChildEvent::StreamClosed { id, stream });
}
