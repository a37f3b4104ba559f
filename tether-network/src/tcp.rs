//! Stream transport: a FIFO of outbound buffers over one TCP socket.

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::SockRef;
use std::io;
use std::net::Shutdown;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use tether_core::{ConnectionId, PeerAddr, SendCallback};

use crate::connection::RecvOutcome;

struct QueuedBuffer {
    data: Bytes,
    on_sent: Option<SendCallback>,
}

pub(crate) struct TcpTransport {
    stream: TcpStream,
    peer: PeerAddr,
    queue: Mutex<Vec<QueuedBuffer>>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, peer: PeerAddr) -> Self {
        Self {
            stream,
            peer,
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn peer(&self) -> PeerAddr {
        self.peer
    }

    pub fn enqueue(&self, data: Bytes, on_sent: Option<SendCallback>) {
        self.queue.lock().push(QueuedBuffer { data, on_sent });
    }

    /// Swap out the queue and write each buffer fully, in order.
    pub async fn flush(&self, id: ConnectionId) {
        let pending = std::mem::take(&mut *self.queue.lock());

        for QueuedBuffer { data, on_sent } in pending {
            match self.write_all(&data).await {
                Ok(()) => trace!("{} wrote {} bytes to {}", id, data.len(), self.peer),
                Err(e) => warn!("{} failed to write {} bytes to {}: {}", id, data.len(), self.peer, e),
            }
            if let Some(on_sent) = on_sent {
                on_sent();
            }
        }
    }

    async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => data = &data[written..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    pub fn recv<F>(&self, id: ConnectionId, scratch: &mut [u8], deliver: F) -> RecvOutcome
    where
        F: FnOnce(&[u8]),
    {
        match self.stream.try_read(scratch) {
            Ok(0) => {
                debug!("{} closed by peer {}", id, self.peer);
                RecvOutcome::Closed
            }
            Ok(read) => {
                trace!("{} read {} bytes", id, read);
                deliver(&scratch[..read]);
                RecvOutcome::Received
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => RecvOutcome::Pending,
            Err(e) => {
                warn!("{} read from {} failed: {}", id, self.peer, e);
                RecvOutcome::Failed
            }
        }
    }

    pub fn shutdown(&self, id: ConnectionId) {
        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            // already disconnected streams report ENOTCONN here
            debug!("{} shutdown: {}", id, e);
        }
    }
}
