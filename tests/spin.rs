use shunt::prelude::*;
use shunt_testing::prelude::*;

#[tokio::test]
async fn times_out_with_the_canned_page() {
    let server = ServerBuilder::default()
        .with_host(
            "slow.example",
            HostEntry::new(ActionSpec::Spin {
                timeout: 1.,
                check_interval: 0.25,
            }),
        )
        .run()
        .await;

    let start = std::time::Instant::now();
    let response = server
        .raw_request(b"GET / HTTP/1.0\r\nHost: slow.example\r\n\r\n")
        .await;
    let elapsed = start.elapsed();

    assert_eq!(response, &include_bytes!("../static/timeout.http")[..]);
    assert!(elapsed >= Duration::from_secs(1), "gave up too early: {elapsed:?}");
    assert!(
        elapsed < Duration::from_millis(2500),
        "held the client far past the deadline: {elapsed:?}"
    );
}

#[tokio::test]
async fn settles_when_the_entry_changes() {
    let server = ServerBuilder::default()
        .with_host(
            "flux.example",
            HostEntry::new(ActionSpec::Spin {
                timeout: 5.,
                check_interval: 0.1,
            }),
        )
        .run()
        .await;

    let balancer = Arc::clone(server.balancer());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        balancer
            .hosts()
            .insert("flux.example", HostEntry::new(ActionSpec::Empty { code: 402 }))
            .unwrap();
    });

    let response = server
        .raw_request(b"GET / HTTP/1.0\r\nHost: flux.example\r\n\r\n")
        .await;
    assert_eq!(
        response,
        &b"HTTP/1.0 402 Payment Required\r\nConnection: close\r\nContent-length: 0\r\n\r\n"[..]
    );
}
