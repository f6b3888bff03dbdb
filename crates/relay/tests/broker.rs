use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use relay::{Broker, RuleTable};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
    time::{sleep, timeout},
};

const REQUEST: &[u8] = b"GET /x HTTP/1.1\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n";
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\nOK";

/// Reserve distinct loopback addresses by holding ephemeral ports open
/// together and letting them all go at once.
fn free_addrs<const N: usize>() -> Result<[SocketAddr; N]> {
    let mut listeners = Vec::with_capacity(N);
    let mut addrs = [SocketAddr::from(([127, 0, 0, 1], 0)); N];

    for addr in addrs.iter_mut() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        *addr = listener.local_addr()?;
        listeners.push(listener);
    }

    Ok(addrs)
}

fn rules(pairs: &[(&str, SocketAddr)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(key, backend)| (key.to_string(), backend.to_string()))
        .collect()
}

fn start_broker(listen: SocketAddr, rules: HashMap<String, String>) -> Result<Arc<Broker>> {
    let broker = Arc::new(Broker::new(RuleTable::new(rules)?));

    let serving = broker.clone();
    tokio::spawn(async move { serving.serve(listen).await.unwrap() });

    Ok(broker)
}

/// Dial the broker from the exact address the rules name, which is what
/// registers a tunnel. Retries cover the gap until the listener is up.
async fn register_backend(broker: SocketAddr, local: SocketAddr) -> Result<TcpStream> {
    for _ in 0..50 {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(local)?;

        match socket.connect(broker).await {
            Ok(stream) => {
                // Give the acceptor a beat to classify and park it.
                sleep(Duration::from_millis(50)).await;
                return Ok(stream);
            }
            Err(_) => sleep(Duration::from_millis(50)).await,
        }
    }

    anyhow::bail!("broker never came up at {broker}")
}

/// Dial the broker, retrying past the gap between `tokio::spawn`ing
/// `serve` and its listener actually being bound.
async fn connect_retry(broker: SocketAddr) -> Result<TcpStream> {
    for _ in 0..50 {
        match TcpStream::connect(broker).await {
            Ok(stream) => return Ok(stream),
            Err(_) => sleep(Duration::from_millis(50)).await,
        }
    }

    anyhow::bail!("broker never came up at {broker}")
}

async fn read_all(mut stream: TcpStream) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut bytes)).await??;
    Ok(bytes)
}

#[tokio::test]
async fn forwards_one_request_and_response() -> Result<()> {
    let [listen, backend_addr] = free_addrs()?;
    let _broker = start_broker(listen, rules(&[("10.0.0.1", backend_addr)]))?;
    let mut backend = register_backend(listen, backend_addr).await?;

    let mut client = TcpStream::connect(listen).await?;
    client.write_all(REQUEST).await?;

    // The backend sees the head bytes exactly as the client sent them.
    let mut request = vec![0u8; REQUEST.len()];
    timeout(Duration::from_secs(5), backend.read_exact(&mut request)).await??;
    assert_eq!(request, REQUEST);

    backend.write_all(RESPONSE).await?;

    assert_eq!(read_all(client).await?, RESPONSE);
    Ok(())
}

#[tokio::test]
async fn unknown_forwarded_ip_gets_nothing() -> Result<()> {
    let [listen, backend_addr] = free_addrs()?;
    let _broker = start_broker(listen, rules(&[("10.0.0.1", backend_addr)]))?;
    let mut backend = register_backend(listen, backend_addr).await?;

    let mut client = TcpStream::connect(listen).await?;
    client
        .write_all(b"GET /x HTTP/1.1\r\nX-Forwarded-For: 10.0.0.2\r\n\r\n")
        .await?;

    // Closed without a byte written, and the backend never hears of it.
    assert_eq!(read_all(client).await?, b"");

    let mut probe = [0u8; 1];
    assert!(
        timeout(Duration::from_millis(300), backend.read(&mut probe))
            .await
            .is_err()
    );
    Ok(())
}

#[tokio::test]
async fn client_without_rules_slot_gets_nothing() -> Result<()> {
    let [listen, backend_addr] = free_addrs()?;
    let _broker = start_broker(listen, rules(&[("10.0.0.1", backend_addr)]))?;

    // No backend ever registered for the key.
    let mut client = connect_retry(listen).await?;
    client.write_all(REQUEST).await?;

    assert_eq!(read_all(client).await?, b"");
    Ok(())
}

#[tokio::test]
async fn one_tunnel_serves_every_component_of_its_key() -> Result<()> {
    let [listen, backend_addr] = free_addrs()?;
    let _broker = start_broker(listen, rules(&[("10.0.0.1;10.0.0.2", backend_addr)]))?;
    let mut backend = register_backend(listen, backend_addr).await?;

    for ip in ["10.0.0.1", "10.0.0.2"] {
        let request = format!("GET /x HTTP/1.1\r\nX-Forwarded-For: {ip}\r\n\r\n");

        let mut client = TcpStream::connect(listen).await?;
        client.write_all(request.as_bytes()).await?;

        let mut seen = vec![0u8; request.len()];
        timeout(Duration::from_secs(5), backend.read_exact(&mut seen)).await??;
        assert_eq!(seen, request.as_bytes());

        backend.write_all(RESPONSE).await?;
        assert_eq!(read_all(client).await?, RESPONSE);
    }

    Ok(())
}

#[tokio::test]
async fn second_client_waits_until_the_first_is_done() -> Result<()> {
    let [listen, backend_addr] = free_addrs()?;
    let _broker = start_broker(listen, rules(&[("10.0.0.1;10.0.0.2", backend_addr)]))?;
    let mut backend = register_backend(listen, backend_addr).await?;

    let mut first = TcpStream::connect(listen).await?;
    first.write_all(REQUEST).await?;
    let first = tokio::spawn(read_all(first));

    let mut request = vec![0u8; REQUEST.len()];
    timeout(Duration::from_secs(5), backend.read_exact(&mut request)).await??;

    // The tunnel is leased to the first client now; a second client for
    // the same key parks on the idle slot.
    let second_request = b"GET /y HTTP/1.1\r\nX-Forwarded-For: 10.0.0.2\r\n\r\n";
    let mut second = TcpStream::connect(listen).await?;
    second.write_all(second_request).await?;
    let second = tokio::spawn(read_all(second));

    let mut probe = [0u8; 1];
    assert!(
        timeout(Duration::from_millis(300), backend.read(&mut probe))
            .await
            .is_err(),
        "second request must not reach the backend during the first lease"
    );

    backend.write_all(RESPONSE).await?;
    assert_eq!(first.await??, RESPONSE);

    // The quiet period returned the tunnel to the pool; only now does
    // the second request come through.
    let mut seen = vec![0u8; second_request.len()];
    timeout(Duration::from_secs(5), backend.read_exact(&mut seen)).await??;
    assert_eq!(seen, second_request);

    backend.write_all(RESPONSE).await?;
    assert_eq!(second.await??, RESPONSE);
    Ok(())
}

#[tokio::test]
async fn requests_longer_than_one_chunk_pump_until_a_short_read() -> Result<()> {
    let [listen, backend_addr] = free_addrs()?;
    let _broker = start_broker(listen, rules(&[("10.0.0.1", backend_addr)]))?;
    let mut backend = register_backend(listen, backend_addr).await?;

    // A head of exactly one chunk is not a request end; the tail that
    // follows is.
    let mut head = b"POST /upload HTTP/1.1\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n".to_vec();
    head.resize(1024, b'a');
    let tail = b"tail of the request body";

    let mut client = TcpStream::connect(listen).await?;
    client.write_all(&head).await?;
    sleep(Duration::from_millis(100)).await;
    client.write_all(tail).await?;

    let mut seen = vec![0u8; head.len() + tail.len()];
    timeout(Duration::from_secs(5), backend.read_exact(&mut seen)).await??;
    assert_eq!(seen[..head.len()], head);
    assert_eq!(&seen[head.len()..], tail);

    backend.write_all(RESPONSE).await?;
    assert_eq!(read_all(client).await?, RESPONSE);
    Ok(())
}

#[tokio::test]
async fn echoed_payload_round_trips_verbatim() -> Result<()> {
    let [listen, backend_addr] = free_addrs()?;
    let _broker = start_broker(listen, rules(&[("10.0.0.1", backend_addr)]))?;
    let mut backend = register_backend(listen, backend_addr).await?;

    let mut client = TcpStream::connect(listen).await?;
    client.write_all(REQUEST).await?;

    let mut request = vec![0u8; REQUEST.len()];
    timeout(Duration::from_secs(5), backend.read_exact(&mut request)).await??;
    backend.write_all(&request).await?;

    assert_eq!(read_all(client).await?, REQUEST);
    Ok(())
}

#[tokio::test]
async fn closing_the_broker_closes_parked_tunnels() -> Result<()> {
    let [listen, backend_addr] = free_addrs()?;
    let broker = start_broker(listen, rules(&[("10.0.0.1", backend_addr)]))?;
    let mut backend = register_backend(listen, backend_addr).await?;

    broker.close();

    let mut probe = [0u8; 1];
    let read = timeout(Duration::from_secs(2), backend.read(&mut probe)).await?;
    assert!(
        matches!(read, Ok(0) | Err(_)),
        "parked backend socket must be closed"
    );
    Ok(())
}

#[tokio::test]
async fn dead_backend_is_evicted_on_the_next_lease() -> Result<()> {
    let [listen, backend_addr] = free_addrs()?;
    let _broker = start_broker(listen, rules(&[("10.0.0.1", backend_addr)]))?;

    let backend = register_backend(listen, backend_addr).await?;
    drop(backend);
    sleep(Duration::from_millis(100)).await;

    // The first client finds the dead tunnel and evicts it; the next
    // finds no slot at all. Both are closed without data.
    for _ in 0..2 {
        let mut client = TcpStream::connect(listen).await?;
        client.write_all(REQUEST).await?;
        assert_eq!(read_all(client).await?, b"");
    }

    Ok(())
}
