use shunt::prelude::*;
use shunt_testing::prelude::*;

/// Binds a backend which accepts one connection, reads until the client
/// half-closes, sends `response` back, and hands the request bytes to
/// the returned handle.
async fn backend(response: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
    let listener = networking::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        stream.write_all(response).await.unwrap();
        drop(stream.shutdown().await);
        received
    });
    (addr, handle)
}

/// An address nothing listens on.
async fn dead_address() -> SocketAddr {
    let listener = networking::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    listener.local_addr().unwrap()
}

fn proxy_entry(backends: &[SocketAddr]) -> HostEntry {
    HostEntry::new(ActionSpec::Proxy {
        backends: backends
            .iter()
            .map(ToCompactString::to_compact_string)
            .collect(),
    })
}

const RESPONSE: &[u8] =
    b"HTTP/1.0 200 OK\r\nContent-length: 7\r\nConnection: close\r\n\r\nproxied";

#[tokio::test]
async fn relays_the_backend_response() {
    let (addr, requests) = backend(RESPONSE).await;
    let server = ServerBuilder::default()
        .with_host("app.example", proxy_entry(&[addr]))
        .run()
        .await;

    let response = server
        .raw_request(b"GET /page HTTP/1.0\r\nHost: app.example\r\n\r\n")
        .await;
    assert_eq!(response, RESPONSE);

    let received = requests.await.unwrap();
    assert!(received.starts_with(b"GET /page HTTP/1.0\r\n"));
    assert!(received
        .windows(b"Host: app.example".len())
        .any(|window| window == b"Host: app.example"));
}

#[tokio::test]
async fn forwards_the_request_body() {
    let (addr, requests) = backend(RESPONSE).await;
    let server = ServerBuilder::default()
        .with_host("app.example", proxy_entry(&[addr]))
        .run()
        .await;

    let response = server
        .raw_request(b"POST /submit HTTP/1.0\r\nHost: app.example\r\nContent-length: 11\r\n\r\nname=foobar")
        .await;
    assert_eq!(response, RESPONSE);

    let received = requests.await.unwrap();
    assert!(received.ends_with(b"\r\n\r\nname=foobar"));
}

#[tokio::test]
async fn skips_past_a_dead_backend() {
    let dead = dead_address().await;
    let (live, _requests) = backend(RESPONSE).await;
    let server = ServerBuilder::default()
        .with_host("app.example", proxy_entry(&[dead, live]))
        .run()
        .await;

    let response = server
        .raw_request(b"GET / HTTP/1.0\r\nHost: app.example\r\n\r\n")
        .await;
    assert_eq!(response, RESPONSE);
}

#[tokio::test]
async fn bad_gateway_when_every_backend_is_down() {
    let server = ServerBuilder::default()
        .with_host(
            "app.example",
            proxy_entry(&[dead_address().await, dead_address().await]),
        )
        .run()
        .await;

    let response = server
        .raw_request(b"GET / HTTP/1.0\r\nHost: app.example\r\n\r\n")
        .await;
    assert_eq!(
        response,
        &b"HTTP/1.0 502 Bad Gateway\r\nConnection: close\r\nContent-length: 0\r\n\r\n"[..]
    );
}
