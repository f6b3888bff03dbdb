use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use clap::Parser;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
    time::timeout,
};

/// Size of one socket read; a read shorter than this ends the request.
const CHUNK_SIZE: usize = 1024;

/// Quiet period on the origin side that ends one response.
const RESPONSE_END: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(
    about = "Reference transit backend: registers a tunnel with the broker and serves requests from a local origin server.",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Broker address to register the tunnel with.
    ///
    #[arg(long, default_value = "127.0.0.1:8000")]
    broker: SocketAddr,
    ///
    /// Local address to dial the broker from. The broker classifies the
    /// connection as a tunnel by this exact `host:port`, so it must
    /// match the backend address of a configured rule.
    ///
    #[arg(long, default_value = "0.0.0.0:8001")]
    local: SocketAddr,
    ///
    /// Origin server that actually answers the forwarded requests.
    ///
    #[arg(long, default_value = "127.0.0.1:9999")]
    origin: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;
    let cli = Cli::parse();

    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(cli.local)?;

    let mut tunnel = socket.connect(cli.broker).await?;

    log::info!(
        "tunnel registered: broker={}, local={}, origin={}",
        cli.broker,
        cli.local,
        cli.origin
    );

    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        // Park until the broker forwards the head of the next request.
        let size = tunnel.read(&mut chunk).await?;
        if size == 0 {
            log::info!("broker closed the tunnel");
            return Ok(());
        }

        if let Err(error) = serve_request(&mut tunnel, &chunk[..size], cli.origin).await {
            log::warn!("request failed: err={error}");
        }
    }
}

/// Bridge one request and response between the tunnel and a fresh origin
/// connection. The request ends on a short read from the tunnel, the
/// response on a quiet period from the origin; the two directions run
/// concurrently because the origin may start answering early.
async fn serve_request(tunnel: &mut TcpStream, head: &[u8], origin: SocketAddr) -> Result<()> {
    let mut origin = TcpStream::connect(origin).await?;

    let (mut tunnel_reader, mut tunnel_writer) = tunnel.split();
    let (mut origin_reader, mut origin_writer) = origin.split();

    let request = async {
        let mut chunk = [0u8; CHUNK_SIZE];
        let mut size = head.len();
        chunk[..size].copy_from_slice(head);

        loop {
            origin_writer.write_all(&chunk[..size]).await?;

            if size < CHUNK_SIZE {
                return Ok::<(), anyhow::Error>(());
            }

            size = tunnel_reader.read(&mut chunk).await?;
        }
    };

    let response = async {
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            let size = match timeout(RESPONSE_END, origin_reader.read(&mut chunk)).await {
                // Quiet period: the response is complete.
                Err(_) => return Ok::<(), anyhow::Error>(()),
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(size)) => size,
                Ok(Err(error)) => return Err(error.into()),
            };

            tunnel_writer.write_all(&chunk[..size]).await?;
        }
    };

    tokio::try_join!(request, response)?;
    Ok(())
}
