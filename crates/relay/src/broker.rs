use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, BufReader, BufWriter},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use crate::{
    CHUNK_SIZE, Error,
    pool::IdlePool,
    rules::RuleTable,
    tunnel::{Downlink, Tunnel, Uplink},
};

/// The transit broker.
///
/// One listener serves both kinds of peer: backends dialing in to park a
/// persistent tunnel, and clients expecting to speak HTTP to whatever
/// backend their forwarded identity maps to. The rule table is fixed for
/// the broker's lifetime; rule edits go through the supervisor, which
/// replaces the whole broker.
pub struct Broker {
    rules: RuleTable,
    pool: IdlePool,
    shutdown: CancellationToken,
}

impl Broker {
    pub fn new(rules: RuleTable) -> Self {
        let shutdown = CancellationToken::new();

        Self {
            rules,
            pool: IdlePool::new(shutdown.clone()),
            shutdown,
        }
    }

    /// Close the broker: the accept loop returns, waiting clients are
    /// turned away, and every persistent backend socket is closed
    /// through its child token.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Accept loop. Classification happens on the remote address alone,
    /// before any bytes are read, because a registering backend never
    /// speaks first.
    pub async fn serve(self: Arc<Self>, listen: SocketAddr) -> Result<(), Error> {
        let listener = TcpListener::bind(listen).await?;

        log::info!("transit broker listening: listen={listen}");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    log::info!("transit broker closed: listen={listen}");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    log::warn!("accept error: err={error}");
                    continue;
                }
            };

            if let Some(key) = self.rules.backend_key(&peer) {
                self.register_tunnel(key.to_string(), peer, stream);
            } else {
                let broker = self.clone();
                tokio::spawn(async move {
                    broker.handle_client(stream, peer).await;
                });
            }
        }
    }

    fn register_tunnel(&self, key: String, peer: SocketAddr, stream: TcpStream) {
        log::info!("tunnel registered: key={key:?}, peer={peer}");

        let tunnel = Tunnel::start(key, peer, stream, self.shutdown.child_token());
        self.pool.register(tunnel);
    }

    /// One client session: sniff the forwarded identity from the first
    /// chunk, borrow the matching idle tunnel, bridge the two sockets for
    /// one request and response, then put the tunnel back or evict it.
    /// The client socket closes when the session ends, whichever way it
    /// ends.
    async fn handle_client(&self, mut stream: TcpStream, peer: SocketAddr) {
        log::info!("client connected: peer={peer}");

        let mut chunk = [0u8; CHUNK_SIZE];
        let size = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(size) => size,
        };
        let head = Bytes::copy_from_slice(&chunk[..size]);

        let Some(ip) = forwarded_ip(&head) else {
            log::warn!("client sent no forwarded identity: peer={peer}");
            return;
        };

        let Some(key) = self.rules.source_key(&ip) else {
            log::info!("no rule for client: peer={peer}, ip={ip:?}");
            return;
        };

        // Blocks while the tunnel is serving someone else; the slot
        // capacity of one is what keeps a tunnel exclusive to a single
        // client at a time.
        let Some(tunnel) = self.pool.acquire(key).await else {
            log::info!("no tunnel registered: peer={peer}, key={key:?}");
            return;
        };

        let (fault, mut faults) = mpsc::channel(2);
        let (done, finished) = oneshot::channel();
        let (reader, writer) = stream.into_split();

        let installed = tunnel
            .begin(
                Uplink {
                    reader: BufReader::new(reader),
                    head,
                    fault: fault.clone(),
                },
                Downlink {
                    writer: BufWriter::new(writer),
                    done,
                    fault,
                },
            )
            .await;

        if !installed {
            // The backend dropped while the tunnel was parked.
            self.pool.evict(tunnel);
            return;
        }

        let closed = tunnel.closed_signal();

        tokio::select! {
            // Checked in order: a pending fault explains a simultaneous
            // done or close, not the other way around.
            biased;

            fault = faults.recv() => match fault {
                Some(fault) if fault.is_tunnel_fatal() => {
                    log::warn!("tunnel fault: peer={peer}, err={fault}");
                    self.pool.evict(tunnel);
                }
                Some(fault) => {
                    log::warn!("client fault: peer={peer}, err={fault}");
                    self.pool.release(tunnel);
                }
                // Both lease halves retired without a fault.
                None => self.pool.release(tunnel),
            },
            _ = finished => {
                self.pool.release(tunnel);
            }
            _ = closed.cancelled() => {
                self.pool.evict(tunnel);
            }
        }

        log::info!("client disconnect: peer={peer}");
    }
}

/// Pull the claimed source IP out of the first client chunk: the value of
/// an `X-Forwarded-For` header, up to the first `;`, trimmed.
///
/// Header names are matched case-insensitively; the rest of the request
/// head is never interpreted.
fn forwarded_ip(head: &[u8]) -> Option<String> {
    for line in head.split(|byte| *byte == b'\n') {
        let line = String::from_utf8_lossy(line);
        if !line.to_ascii_lowercase().contains("x-forwarded-for") {
            continue;
        }

        if let Some((_, value)) = line.split_once(':') {
            let ip = value.split(';').next().unwrap_or_default().trim();
            if !ip.is_empty() {
                return Some(ip.to_string());
            }
        }
    }

    None
}
