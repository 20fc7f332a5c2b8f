//! Challenge port arbitration against real loopback sockets.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use certkeeper_common::CertError;
use certkeeper_daemon::PortArbiter;

use common::{free_port, MockHostListener};

fn bind_loopback() -> (std::net::TcpListener, u16) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn test_free_port_acquire_then_release_is_a_no_op() {
    let host = Arc::new(MockHostListener::new(false));
    let arbiter = PortArbiter::new(host.clone(), free_port());

    arbiter.acquire(&CancellationToken::new()).await.unwrap();
    arbiter.release().await.unwrap();

    assert_eq!(host.pauses(), 0);
    assert_eq!(host.resumes(), 0);
}

#[tokio::test]
async fn test_external_occupant_is_refused_without_pausing() {
    let (_external, port) = bind_loopback();
    let host = Arc::new(MockHostListener::new(false));
    let arbiter = PortArbiter::new(host.clone(), port);

    let status = arbiter.check_status().await;
    assert!(status.occupied);
    assert!(!status.owned_by_panel);

    let err = arbiter.acquire(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, CertError::Port80External { port: p } if p == port));
    assert!(!err.is_retryable());
    assert_eq!(host.pauses(), 0);
    assert_eq!(host.resumes(), 0);
}

#[tokio::test]
async fn test_configured_flag_wins_over_probe() {
    // Nothing is bound, but the host is configured to listen
    let host = Arc::new(MockHostListener::new(true));
    let arbiter = PortArbiter::new(host, free_port());

    assert!(!arbiter.probe().await);
    let status = arbiter.check_status().await;
    assert!(status.owned_by_panel);
    assert!(status.occupied);
}

#[tokio::test]
async fn test_host_releases_after_two_polls() {
    let (socket, port) = bind_loopback();
    let host = Arc::new(
        MockHostListener::new(true).holding(socket, Some(Duration::from_millis(150))),
    );
    let arbiter = PortArbiter::new(host.clone(), port);

    let started = std::time::Instant::now();
    arbiter.acquire(&CancellationToken::new()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(host.pauses(), 1);
    assert_eq!(host.resumes(), 0);
    assert!(elapsed >= Duration::from_millis(150), "acquired after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "acquired after {:?}", elapsed);

    arbiter.release().await.unwrap();
    assert_eq!(host.resumes(), 1);
}

#[tokio::test]
async fn test_host_that_never_releases_is_resumed() {
    let (socket, port) = bind_loopback();
    let host = Arc::new(MockHostListener::new(true).holding(socket, None));
    let arbiter = PortArbiter::new(host.clone(), port);

    let err = arbiter.acquire(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, CertError::Port80Occupied { .. }));
    assert!(err.is_retryable());
    assert_eq!(host.pauses(), 1);
    assert_eq!(host.resumes(), 1);
}

#[tokio::test]
async fn test_cancel_during_poll_resumes_host() {
    let (socket, port) = bind_loopback();
    let host = Arc::new(MockHostListener::new(true).holding(socket, None));
    let arbiter = PortArbiter::new(host.clone(), port);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let err = arbiter.acquire(&cancel).await.unwrap_err();
    assert!(matches!(err, CertError::Cancelled));
    assert_eq!(host.resumes(), 1);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let host = Arc::new(MockHostListener::new(true));
    let arbiter = PortArbiter::new(host.clone(), free_port());

    arbiter.release().await.unwrap();
    arbiter.release().await.unwrap();
    assert_eq!(host.resumes(), 2);
}
