//! Integration tests for the multiplexed UDP transport.
//!
//! Each test drives one or two managers bound to loopback sockets, the
//! same shape as two relay endpoints sharing a socket pair in production.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use peermux_transport::{
    Frame, Manager, ManagerConfig, SimpleTrack, TrackEventKind, TransportError,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

/// Bound on every await that crosses the loopback.
const WINDOW: Duration = Duration::from_secs(1);

/// Long enough for anything in flight to land, short enough to assert
/// that nothing arrives.
const QUIET: Duration = Duration::from_millis(200);

fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peermux_transport=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

async fn manager_on_loopback() -> Result<Manager> {
    init_logging();
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    Ok(Manager::new(ManagerConfig::new(socket))?)
}

/// The end-to-end scenario: one side originates a stream and announces a
/// track; the other side observes the factory, the transport, and the
/// add event, all over the wire.
#[tokio::test]
async fn stream_and_track_propagate_to_the_peer() -> Result<()> {
    let tm1 = manager_on_loopback().await?;
    let tm2 = manager_on_loopback().await?;

    let f2 = tm2.get_factory(tm1.local_addr()).await?;
    let t2 = f2.new_transport("test-stream").await?;
    t2.add_track(&SimpleTrack::new(8, 1, "aa")).await?;

    let f1 = timeout(WINDOW, tm1.next_factory())
        .await?
        .expect("factory queue ended");
    assert_eq!(f1.peer_addr(), tm2.local_addr());

    let t1 = timeout(WINDOW, f1.next_transport())
        .await?
        .expect("transport queue ended");
    assert_eq!(t1.stream_id(), "test-stream");

    let event = timeout(WINDOW, t1.next_track_event())
        .await?
        .expect("event queue ended");
    assert_eq!(event.kind, TrackEventKind::Add);
    assert_eq!(event.track.payload_type, 8);
    assert_eq!(event.track.ssrc, 1);
    assert_eq!(event.track.label, "aa");

    t1.close().await;
    t2.close().await;
    tm1.close().await;
    tm2.close().await;
    Ok(())
}

#[tokio::test]
async fn data_payloads_flow_in_both_directions() -> Result<()> {
    let tm1 = manager_on_loopback().await?;
    let tm2 = manager_on_loopback().await?;

    let f2 = tm2.get_factory(tm1.local_addr()).await?;
    let t2 = f2.new_transport("media").await?;

    let f1 = timeout(WINDOW, tm1.next_factory())
        .await?
        .expect("factory queue ended");
    let t1 = timeout(WINDOW, f1.next_transport())
        .await?
        .expect("transport queue ended");

    t2.send(Bytes::from_static(b"from-2"))?;
    let payload = timeout(WINDOW, t1.recv()).await?.expect("data queue ended");
    assert_eq!(payload, Bytes::from_static(b"from-2"));

    t1.send(Bytes::from_static(b"from-1"))?;
    let payload = timeout(WINDOW, t2.recv()).await?.expect("data queue ended");
    assert_eq!(payload, Bytes::from_static(b"from-1"));

    tm1.close().await;
    tm2.close().await;
    Ok(())
}

#[tokio::test]
async fn remove_track_reaches_the_peer() -> Result<()> {
    let tm1 = manager_on_loopback().await?;
    let tm2 = manager_on_loopback().await?;

    let f2 = tm2.get_factory(tm1.local_addr()).await?;
    let t2 = f2.new_transport("cam").await?;
    t2.add_track(&SimpleTrack::new(96, 7, "camera")).await?;

    let f1 = timeout(WINDOW, tm1.next_factory())
        .await?
        .expect("factory queue ended");
    let t1 = timeout(WINDOW, f1.next_transport())
        .await?
        .expect("transport queue ended");

    let event = timeout(WINDOW, t1.next_track_event())
        .await?
        .expect("event queue ended");
    assert_eq!(event.kind, TrackEventKind::Add);
    assert_eq!(t1.tracks().await.len(), 1);
    assert_eq!(t2.tracks().await.len(), 1);

    t2.remove_track(7).await?;
    let event = timeout(WINDOW, t1.next_track_event())
        .await?
        .expect("event queue ended");
    assert_eq!(event.kind, TrackEventKind::Remove);
    assert_eq!(event.track.ssrc, 7);
    assert!(t1.tracks().await.is_empty());
    assert!(t2.tracks().await.is_empty());

    // Removing it again changes nothing on either side.
    t2.remove_track(7).await?;
    assert!(timeout(QUIET, t1.next_track_event()).await.is_err());

    tm1.close().await;
    tm2.close().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_local_creations_converge() -> Result<()> {
    let tm1 = manager_on_loopback().await?;
    let tm2 = manager_on_loopback().await?;

    let factory = tm2.get_factory(tm1.local_addr()).await?;
    let (a, b) = tokio::join!(
        factory.new_transport("shared"),
        factory.new_transport("shared")
    );
    let (a, b) = (a?, b?);
    assert!(Arc::ptr_eq(&a, &b));

    // Only one registration, so only one notification.
    let first = timeout(WINDOW, factory.next_transport())
        .await?
        .expect("transport queue ended");
    assert!(Arc::ptr_eq(&first, &a));
    assert!(timeout(QUIET, factory.next_transport()).await.is_err());

    tm1.close().await;
    tm2.close().await;
    Ok(())
}

#[tokio::test]
async fn get_factory_is_idempotent() -> Result<()> {
    let tm1 = manager_on_loopback().await?;
    let tm2 = manager_on_loopback().await?;

    let a = tm2.get_factory(tm1.local_addr()).await?;
    let b = tm2.get_factory(tm1.local_addr()).await?;
    assert!(Arc::ptr_eq(&a, &b));

    let first = timeout(WINDOW, tm2.next_factory())
        .await?
        .expect("factory queue ended");
    assert!(Arc::ptr_eq(&first, &a));
    assert!(timeout(QUIET, tm2.next_factory()).await.is_err());

    tm1.close().await;
    tm2.close().await;
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent_at_every_level() -> Result<()> {
    let tm1 = manager_on_loopback().await?;
    let tm2 = manager_on_loopback().await?;

    let factory = tm2.get_factory(tm1.local_addr()).await?;
    let transport = factory.new_transport("s").await?;

    transport.close().await;
    transport.close().await;
    assert!(transport.is_closed());

    factory.close().await;
    factory.close().await;
    assert!(factory.is_closed());

    tm2.close().await;
    tm2.close().await;
    assert!(tm2.is_closed());

    tm1.close().await;
    Ok(())
}

#[tokio::test]
async fn operations_on_closed_components_fail_fast() -> Result<()> {
    let tm1 = manager_on_loopback().await?;
    let tm2 = manager_on_loopback().await?;

    let factory = tm2.get_factory(tm1.local_addr()).await?;
    let transport = factory.new_transport("s").await?;
    assert_ok!(transport.send(Bytes::from_static(b"live")));

    transport.close().await;
    assert!(matches!(
        transport.send(Bytes::from_static(b"late")),
        Err(TransportError::Closed)
    ));
    assert!(matches!(
        transport.add_track(&SimpleTrack::new(8, 1, "aa")).await,
        Err(TransportError::Closed)
    ));
    assert!(matches!(
        transport.remove_track(1).await,
        Err(TransportError::Closed)
    ));

    factory.close().await;
    assert_err!(factory.new_transport("other").await);

    tm2.close().await;
    assert!(matches!(
        tm2.get_factory(tm1.local_addr()).await,
        Err(TransportError::Closed)
    ));

    tm1.close().await;
    Ok(())
}

#[tokio::test]
async fn manager_close_cascades_and_ends_every_queue() -> Result<()> {
    let tm1 = manager_on_loopback().await?;
    let tm2 = manager_on_loopback().await?;

    let f2 = tm2.get_factory(tm1.local_addr()).await?;
    let _t2 = f2.new_transport("s").await?;

    let f1 = timeout(WINDOW, tm1.next_factory())
        .await?
        .expect("factory queue ended");
    let t1 = timeout(WINDOW, f1.next_transport())
        .await?
        .expect("transport queue ended");

    // close() waits for the receive loop and egress writer, so once it
    // returns no background task of tm1 remains runnable.
    tm1.close().await;

    assert!(tm1.is_closed());
    assert!(f1.is_closed());
    assert!(t1.is_closed());

    assert!(tm1.next_factory().await.is_none());
    assert!(f1.next_transport().await.is_none());
    assert!(t1.recv().await.is_none());
    assert!(t1.next_track_event().await.is_none());

    tm2.close().await;
    Ok(())
}

#[tokio::test]
async fn peer_close_tears_down_the_remote_transport() -> Result<()> {
    let tm1 = manager_on_loopback().await?;
    let tm2 = manager_on_loopback().await?;

    let f2 = tm2.get_factory(tm1.local_addr()).await?;
    let t2 = f2.new_transport("s").await?;

    let f1 = timeout(WINDOW, tm1.next_factory())
        .await?
        .expect("factory queue ended");
    let t1 = timeout(WINDOW, f1.next_transport())
        .await?
        .expect("transport queue ended");

    t2.close().await;

    // The stream-close frame ends the peer transport and its queues.
    assert_eq!(timeout(WINDOW, t1.recv()).await?, None);
    assert!(t1.is_closed());

    tm1.close().await;
    tm2.close().await;
    Ok(())
}

#[tokio::test]
async fn malformed_datagrams_do_not_disturb_the_receive_loop() -> Result<()> {
    let tm1 = manager_on_loopback().await?;

    let raw = UdpSocket::bind("127.0.0.1:0").await?;
    // Unrecognized kind, short header, truncated stream id.
    raw.send_to(&[0xff, 0, 0, 0, 0], tm1.local_addr()).await?;
    raw.send_to(&[1], tm1.local_addr()).await?;
    raw.send_to(&[3, 0, 10, b'a'], tm1.local_addr()).await?;

    // None of them may create a factory.
    assert!(timeout(QUIET, tm1.next_factory()).await.is_err());

    // The loop is still alive: a valid open goes through.
    raw.send_to(&Frame::open("s").encode()?, tm1.local_addr())
        .await?;
    let factory = timeout(WINDOW, tm1.next_factory())
        .await?
        .expect("factory queue ended");
    assert_eq!(factory.peer_addr(), raw.local_addr()?);

    tm1.close().await;
    Ok(())
}

#[tokio::test]
async fn non_open_frames_never_create_streams() -> Result<()> {
    let tm1 = manager_on_loopback().await?;

    let raw = UdpSocket::bind("127.0.0.1:0").await?;
    raw.send_to(
        &Frame::data("ghost", Bytes::from_static(b"x")).encode()?,
        tm1.local_addr(),
    )
    .await?;

    // The source address is a newly observed peer, so a factory appears,
    // but the unknown stream is dropped rather than registered.
    let factory = timeout(WINDOW, tm1.next_factory())
        .await?
        .expect("factory queue ended");
    assert!(timeout(QUIET, factory.next_transport()).await.is_err());

    tm1.close().await;
    Ok(())
}
