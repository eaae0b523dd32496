//! The local HTTP proxy end to end over an in-test SOCKS5 server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use claude_proxy::health::HealthClient;
use claude_proxy::proxy::HttpProxy;
use claude_proxy::socks::Socks5Dialer;
use httpmock::Method::GET;
use httpmock::MockServer;

use common::{closed_port, connect_via, echo_server, round_trip, SocksServer};

async fn proxy_over(socks: &SocksServer, id: &str) -> HttpProxy {
    let dialer = Arc::new(Socks5Dialer::new(socks.addr).with_timeout(Duration::from_secs(5)));
    HttpProxy::start("127.0.0.1:0".parse().unwrap(), dialer, id)
        .await
        .unwrap()
}

#[tokio::test]
async fn connect_tunnels_bytes_through_socks() {
    let socks = SocksServer::start().await;
    let echo = echo_server().await;
    let proxy = proxy_over(&socks, "e2e-connect").await;

    let target = format!("127.0.0.1:{}", echo.port());
    let (head, mut stream) = connect_via(proxy.local_addr(), &target).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(round_trip(&mut stream, b"ping over tunnel").await, b"ping over tunnel");
    assert_eq!(round_trip(&mut stream, b"second").await, b"second");
    assert_eq!(socks.requests(), vec![target]);

    drop(stream);
    proxy.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn connect_to_unreachable_target_is_bad_gateway() {
    let socks = SocksServer::start().await;
    let proxy = proxy_over(&socks, "e2e-502").await;

    let target = format!("127.0.0.1:{}", closed_port().await);
    let (head, _stream) = connect_via(proxy.local_addr(), &target).await;
    assert!(head.starts_with("HTTP/1.1 502"), "{head}");
    proxy.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn absolute_form_request_is_forwarded_without_proxy_headers() {
    let origin = MockServer::start_async().await;
    let hello = origin
        .mock_async(|when, then| {
            when.method(GET)
                .path("/hello")
                .query_param("q", "1")
                .header("x-test", "kept")
                .header_missing("proxy-connection");
            then.status(200).body("hi from origin");
        })
        .await;

    let socks = SocksServer::start().await;
    let proxy = proxy_over(&socks, "e2e-forward").await;
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", proxy.local_addr())).unwrap())
        .build()
        .unwrap();

    let resp = client
        .get(origin.url("/hello?q=1"))
        .header("x-test", "kept")
        .header("proxy-connection", "keep-alive")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hi from origin");
    hello.assert_async().await;
    assert_eq!(socks.requests(), vec![origin.address().to_string()]);

    proxy.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn health_endpoint_reports_instance_id() {
    let socks = SocksServer::start().await;
    let proxy = proxy_over(&socks, "e2e-health").await;
    let port = proxy.local_addr().port();

    let health = HealthClient::default();
    health.check_http_proxy(port, "e2e-health").await.unwrap();
    assert!(health.check_http_proxy(port, "someone-else").await.is_err());
    assert!(socks.requests().is_empty());

    proxy.close(Duration::from_secs(1)).await;
    assert!(health.check_http_proxy(port, "e2e-health").await.is_err());
}
