use shunt::prelude::*;
use shunt_testing::prelude::*;

const UNKNOWN: &[u8] = include_bytes!("../static/unknown.http");
const NO_HOSTS: &[u8] = include_bytes!("../static/no-hosts.http");

/// The payload part of a canned response file.
fn body_of(raw: &[u8]) -> &[u8] {
    let blank_line = raw.windows(4).position(|window| window == b"\r\n\r\n").unwrap();
    &raw[blank_line + 4..]
}

#[tokio::test]
async fn no_hosts_page_when_table_is_empty() {
    let server = ServerBuilder::default().run().await;
    let response = server
        .raw_request(b"GET / HTTP/1.0\r\nHost: anything.example\r\n\r\n")
        .await;
    assert_eq!(response, NO_HOSTS);
}

#[tokio::test]
async fn unknown_host_gets_the_canned_page() {
    let server = ServerBuilder::default()
        .with_host("present.example", HostEntry::new(ActionSpec::Empty { code: 200 }))
        .run()
        .await;

    let response = server
        .get("/")
        .header("host", "absent.example")
        .timeout(Duration::from_secs(1))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.bytes().await.unwrap().as_ref(), body_of(UNKNOWN));
}

#[tokio::test]
async fn static_file_is_sent_verbatim() {
    const GREETING: &[u8] =
        b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-length: 5\r\nConnection: close\r\n\r\nhello";
    let server = ServerBuilder::default()
        .with_host(
            "hi.example",
            HostEntry::new(ActionSpec::Static {
                file: "greeting".into(),
            }),
        )
        .with_asset("greeting", GREETING)
        .run()
        .await;

    let response = server
        .raw_request(b"GET / HTTP/1.0\r\nHost: hi.example\r\n\r\n")
        .await;
    assert_eq!(response, GREETING);
}

#[tokio::test]
async fn empty_action_byte_for_byte() {
    let server = ServerBuilder::default()
        .with_host("pay.example", HostEntry::new(ActionSpec::Empty { code: 402 }))
        .run()
        .await;

    let response = server
        .raw_request(b"GET / HTTP/1.0\r\nHost: pay.example\r\n\r\n")
        .await;
    assert_eq!(
        response,
        &b"HTTP/1.0 402 Payment Required\r\nConnection: close\r\nContent-length: 0\r\n\r\n"[..]
    );
}

#[tokio::test]
async fn redirect_keeps_the_path_and_protocol() {
    let server = ServerBuilder::default()
        .with_host(
            "old.example",
            HostEntry::new(ActionSpec::Redirect {
                to: "new.example".into(),
            }),
        )
        .run()
        .await;

    let response = server
        .raw_request(b"GET /some/path HTTP/1.0\r\nHost: old.example\r\n\r\n")
        .await;
    assert_eq!(
        response,
        &b"HTTP/1.0 302 Found\r\nLocation: http://new.example/some/path\r\n\r\n"[..]
    );

    // a TLS terminator in front of the balancer marks its requests
    let response = server
        .raw_request(
            b"GET /login HTTP/1.0\r\nHost: old.example\r\nX-Forwarded-Protocol: SSL\r\n\r\n",
        )
        .await;
    assert_eq!(
        response,
        &b"HTTP/1.0 302 Found\r\nLocation: https://new.example/login\r\n\r\n"[..]
    );
}

#[tokio::test]
async fn wildcard_matches_subdomains_only() {
    let server = ServerBuilder::default()
        .with_host("*.wild.example", HostEntry::new(ActionSpec::Empty { code: 402 }))
        .run()
        .await;

    let response = server
        .raw_request(b"GET / HTTP/1.0\r\nHost: a.b.wild.example\r\n\r\n")
        .await;
    assert_eq!(
        response,
        &b"HTTP/1.0 402 Payment Required\r\nConnection: close\r\nContent-length: 0\r\n\r\n"[..]
    );

    // the bare domain isn't covered by its subdomain pattern
    let response = server
        .raw_request(b"GET / HTTP/1.0\r\nHost: wild.example\r\n\r\n")
        .await;
    assert_eq!(response, UNKNOWN);
}

#[tokio::test]
async fn disabled_entry_is_not_served() {
    let server = ServerBuilder::default()
        .with_host(
            "off.example",
            HostEntry::new(ActionSpec::Empty { code: 200 }).disabled(),
        )
        .run()
        .await;

    let response = server
        .get("/")
        .header("host", "off.example")
        .timeout(Duration::from_secs(1))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
