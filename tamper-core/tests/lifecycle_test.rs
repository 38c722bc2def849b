use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tamper_core::{new_proxy, ProxyError, ProxyMode, ProxyState};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn test_start_binds_and_shutdown_releases_port() {
    let proxy = new_proxy("http://127.0.0.1:9", 0, ProxyMode::Reverse, Some("lifecycle")).unwrap();
    proxy.start().await.unwrap();
    assert_eq!(proxy.state(), ProxyState::Listening);

    let addr = proxy.local_addr().expect("bound address");
    assert_ne!(addr.port(), 0);
    assert!(proxy.description().contains(&format!(":{} for", addr.port())));
    TcpStream::connect(addr).await.expect("proxy accepts connections");

    proxy.shutdown().await.unwrap();
    assert_eq!(proxy.state(), ProxyState::Shutdown);
    assert!(proxy.local_addr().is_none());

    // the port is free again
    TcpListener::bind(addr).await.expect("port released after shutdown");
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let proxy = new_proxy("http://127.0.0.1:9", 0, ProxyMode::Reverse, None).unwrap();
    proxy.start().await.unwrap();
    let addr = proxy.local_addr();

    assert!(matches!(proxy.start().await, Err(ProxyError::Lifecycle(_))));
    assert_eq!(proxy.state(), ProxyState::Listening);
    assert_eq!(proxy.local_addr(), addr);

    proxy.shutdown().await.unwrap();
    assert!(matches!(proxy.start().await, Err(ProxyError::Lifecycle(_))));
    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bind_conflict_is_reported() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let proxy = new_proxy("http://127.0.0.1:9", port, ProxyMode::Reverse, None).unwrap();
    match proxy.start().await {
        Err(ProxyError::Bind { addr, .. }) => assert_eq!(addr.port(), port),
        other => panic!("expected bind error, got {:?}", other),
    }
    assert_eq!(proxy.state(), ProxyState::Initialized);
    assert!(proxy.local_addr().is_none());
}

#[tokio::test]
async fn test_direct_mode_starts_with_ephemeral_ca() {
    let proxy = new_proxy("https://example.com", 0, ProxyMode::Direct, Some("direct")).unwrap();
    proxy.start().await.unwrap();
    assert_eq!(proxy.client_endpoint_url(), "https://example.com");
    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_started_proxy_keeps_its_port() {
    let proxy = new_proxy("http://127.0.0.1:9", 0, ProxyMode::Reverse, None).unwrap();
    proxy.start().await.unwrap();
    let addr = proxy.local_addr().unwrap();

    assert!(std::net::TcpListener::bind(addr).is_err());
    proxy.shutdown().await.unwrap();
}

/// Another listener races for the port while the proxy starts. Whoever wins,
/// `start` must agree with who actually owns the port.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_reports_lost_port_race() {
    for _ in 0..10 {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let stop = Arc::new(AtomicBool::new(false));
        let racing = stop.clone();
        let racer = std::thread::spawn(move || {
            while !racing.load(Ordering::SeqCst) {
                if let Ok(listener) = std::net::TcpListener::bind(("127.0.0.1", port)) {
                    return Some(listener);
                }
            }
            None
        });

        let proxy = new_proxy("http://127.0.0.1:9", port, ProxyMode::Reverse, None).unwrap();
        let started = proxy.start().await;
        stop.store(true, Ordering::SeqCst);
        let taken = racer.join().unwrap();

        match (started, taken) {
            (Ok(()), None) => {
                assert_eq!(proxy.state(), ProxyState::Listening);
                assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_err());
            }
            (Ok(()), Some(_)) => panic!("proxy reported listening on port {} owned by another listener", port),
            (Err(ProxyError::Bind { .. }), _) => assert_eq!(proxy.state(), ProxyState::Initialized),
            (Err(e), _) => panic!("unexpected start error: {}", e),
        }
        proxy.shutdown().await.unwrap();
    }
}
