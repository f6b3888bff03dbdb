use std::{io, net::SocketAddr};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::{CHUNK_SIZE, RESPONSE_END};

/// Which side of the bridge a transport failure happened on.
///
/// Backend failures make the persistent socket unusable and cost the
/// whole tunnel; client failures only cost the request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSide {
    Client,
    Backend,
}

#[derive(Debug, thiserror::Error)]
#[error("{side:?} side transport error: {source}")]
pub struct TransportError {
    pub side: FaultSide,
    #[source]
    pub source: io::Error,
}

impl TransportError {
    fn client(source: io::Error) -> Self {
        Self {
            side: FaultSide::Client,
            source,
        }
    }

    fn backend(source: io::Error) -> Self {
        Self {
            side: FaultSide::Backend,
            source,
        }
    }

    pub fn is_tunnel_fatal(&self) -> bool {
        self.side == FaultSide::Backend
    }
}

/// Client half handed to the uplink loop for one request: the buffered
/// reader, the head chunk the session already consumed while sniffing the
/// forwarded identity, and a fresh fault slot.
pub(crate) struct Uplink {
    pub reader: BufReader<OwnedReadHalf>,
    pub head: Bytes,
    pub fault: mpsc::Sender<TransportError>,
}

/// Client half handed to the downlink loop for one response.
pub(crate) struct Downlink {
    pub writer: BufWriter<OwnedWriteHalf>,
    pub done: oneshot::Sender<()>,
    pub fault: mpsc::Sender<TransportError>,
}

/// One persistent backend connection.
///
/// The socket is split at registration and each half is owned by a pump
/// loop: uplink moves request bytes from the current client to the
/// backend, downlink moves response bytes back. Between requests both
/// loops park on their lease channel; the handle below is what travels
/// through the idle pool, and whoever holds it is the only client
/// attached to the tunnel.
///
/// The `done` and fault slots are created per lease by the client
/// session, so a signal from an earlier request can never unblock a later
/// one. The close signal is tunnel-wide: a child of the broker shutdown
/// token, cancelled when the backend socket is gone, and terminal.
pub struct Tunnel {
    key: String,
    peer: SocketAddr,
    uplink: mpsc::Sender<Uplink>,
    downlink: mpsc::Sender<Downlink>,
    closed: CancellationToken,
}

impl Tunnel {
    /// Split the registered backend socket and start the two pump loops.
    pub(crate) fn start(
        key: String,
        peer: SocketAddr,
        stream: TcpStream,
        closed: CancellationToken,
    ) -> Self {
        let (backend_reader, backend_writer) = stream.into_split();

        let (uplink, uplink_leases) = mpsc::channel(1);
        let (downlink, downlink_leases) = mpsc::channel(1);

        tokio::spawn(uplink_loop(backend_writer, uplink_leases, closed.clone()));
        tokio::spawn(downlink_loop(backend_reader, downlink_leases, closed.clone()));

        Self {
            key,
            peer,
            uplink,
            downlink,
            closed,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Hand the client halves to the pump loops. Fails when the tunnel
    /// died while parked, meaning the backend socket is already gone.
    pub(crate) async fn begin(&self, uplink: Uplink, downlink: Downlink) -> bool {
        self.uplink.send(uplink).await.is_ok() && self.downlink.send(downlink).await.is_ok()
    }

    pub(crate) fn closed_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Terminal: both loops exit at their next select point and the
    /// backend socket closes with them.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for Tunnel {
    /// A handle nobody parked or leased is unreachable, close the socket
    /// rather than leak the loops.
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

enum UplinkEnd {
    /// The backend hung up mid-write; the tunnel is finished.
    BackendGone,
    Fault(TransportError),
}

/// Client to backend pump. Parks until a lease arrives, serves exactly
/// one request, parks again.
async fn uplink_loop(
    mut backend: OwnedWriteHalf,
    mut leases: mpsc::Receiver<Uplink>,
    closed: CancellationToken,
) {
    loop {
        let Uplink { reader, head, fault } = tokio::select! {
            _ = closed.cancelled() => break,
            lease = leases.recv() => match lease {
                Some(lease) => lease,
                None => break,
            },
        };

        match pump_request(&mut backend, reader, &head).await {
            Ok(()) => {}
            Err(UplinkEnd::BackendGone) => {
                closed.cancel();
                break;
            }
            Err(UplinkEnd::Fault(error)) => {
                let _ = fault.try_send(error);
            }
        }
    }
}

/// Move one request to the backend: the already-sniffed head bytes first,
/// then whole chunks from the client until a short read marks the end of
/// the request.
async fn pump_request(
    backend: &mut OwnedWriteHalf,
    mut reader: BufReader<OwnedReadHalf>,
    head: &Bytes,
) -> Result<(), UplinkEnd> {
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut size = head.len();
    chunk[..size].copy_from_slice(head);

    loop {
        if size > 0 {
            if let Err(error) = backend.write_all(&chunk[..size]).await {
                return Err(if connection_gone(&error) {
                    UplinkEnd::BackendGone
                } else {
                    UplinkEnd::Fault(TransportError::backend(error))
                });
            }
        }

        if size < CHUNK_SIZE {
            return Ok(());
        }

        size = match reader.read(&mut chunk).await {
            Ok(size) => size,
            Err(error) => return Err(UplinkEnd::Fault(TransportError::client(error))),
        };
    }
}

fn connection_gone(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

/// Backend to client pump.
///
/// An inner task reads the backend into a capacity-one hand-off channel
/// for the whole life of the tunnel; the outer loop parks between leases
/// and, while one is active, writes hand-off chunks to the client until a
/// quiet period of [`RESPONSE_END`] marks the response as complete.
async fn downlink_loop(
    backend: OwnedReadHalf,
    mut leases: mpsc::Receiver<Downlink>,
    closed: CancellationToken,
) {
    let (chunks, mut handoff) = mpsc::channel::<Bytes>(1);
    let (ends, mut end) = mpsc::channel::<io::Error>(1);
    tokio::spawn(read_backend(backend, chunks, ends, closed.clone()));

    'parked: loop {
        let Downlink {
            mut writer,
            done,
            fault,
        } = tokio::select! {
            _ = closed.cancelled() => break,
            lease = leases.recv() => match lease {
                Some(lease) => lease,
                None => break,
            },
        };

        // Bytes that arrived after a previous response hit the quiet
        // cutoff belong to no lease; drop them instead of corrupting
        // this one.
        while handoff.try_recv().is_ok() {}

        loop {
            tokio::select! {
                _ = sleep(RESPONSE_END) => {
                    // Quiet period: the response is complete once
                    // everything buffered has reached the client.
                    match writer.flush().await {
                        Ok(()) => {
                            let _ = done.send(());
                        }
                        Err(error) => {
                            let _ = fault.try_send(TransportError::client(error));
                        }
                    }
                    continue 'parked;
                }
                error = end.recv() => {
                    match error {
                        Some(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                            closed.cancel();
                        }
                        Some(error) => {
                            let _ = fault.try_send(TransportError::backend(error));
                            continue 'parked;
                        }
                        None => {}
                    }
                    break 'parked;
                }
                chunk = handoff.recv() => {
                    match chunk {
                        Some(chunk) => {
                            if let Err(error) = writer.write_all(&chunk).await {
                                let _ = fault.try_send(TransportError::client(error));
                                continue 'parked;
                            }
                        }
                        None => break 'parked,
                    }
                }
            }
        }
    }
}

/// Reads the backend forever. End of file is reported as an
/// `UnexpectedEof` error so the outer loop has a single channel to watch
/// for "the backend is done talking".
async fn read_backend(
    mut backend: OwnedReadHalf,
    chunks: mpsc::Sender<Bytes>,
    ends: mpsc::Sender<io::Error>,
    closed: CancellationToken,
) {
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            _ = closed.cancelled() => return,
            read = backend.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                let _ = ends.send(io::ErrorKind::UnexpectedEof.into()).await;
                return;
            }
            Ok(size) => {
                if chunks.send(Bytes::copy_from_slice(&chunk[..size])).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                let _ = ends.send(error).await;
                return;
            }
        }
    }
}
