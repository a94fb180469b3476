use shunt::prelude::*;
use shunt_testing::prelude::*;

#[tokio::test]
async fn in_flight_requests_finish() {
    let server = ServerBuilder::default()
        .with_host(
            "slow.example",
            HostEntry::new(ActionSpec::Spin {
                timeout: 1.,
                check_interval: 0.1,
            }),
        )
        .run()
        .await;

    tokio::time::timeout(Duration::from_secs(3), async move {
        let shutdown = server.get_shutdown_manager();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            shutdown.shutdown();
        });

        // in flight before the shutdown, so it runs to its own conclusion
        let response = server
            .raw_request(b"GET / HTTP/1.0\r\nHost: slow.example\r\n\r\n")
            .await;
        assert_eq!(response, &include_bytes!("../static/timeout.http")[..]);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn wait_resolves_once_drained() {
    let server = ServerBuilder::default()
        .with_host(
            "slow.example",
            HostEntry::new(ActionSpec::Spin {
                timeout: 0.5,
                check_interval: 0.1,
            }),
        )
        .run()
        .await;
    let shutdown = server.get_shutdown_manager();
    let port = server.port();

    let request = tokio::spawn(async move {
        let mut stream = networking::TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        stream
            .write_all(b"GET / HTTP/1.0\r\nHost: slow.example\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(2), shutdown.wait())
        .await
        .unwrap();
    assert_eq!(shutdown.connections(), 0);

    let response = request.await.unwrap();
    assert!(
        response.starts_with(b"HTTP/1.0 504"),
        "unexpected response: {}",
        String::from_utf8_lossy(&response)
    );

    // the listeners went away with the accept loops
    tokio::time::sleep(Duration::from_millis(100)).await;
    let refused = networking::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await;
    assert!(refused.is_err(), "the balancer still accepts connections");
}
