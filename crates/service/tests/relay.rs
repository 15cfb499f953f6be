use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use bytes::BytesMut;
use codec::Frame;
use parking_lot::Mutex;
use uturn_service::{Error, Relay, RelayHandler, RelayOptions, SERVER_ID};

#[derive(Default, Clone)]
struct Handler {
    registered: Arc<Mutex<Vec<(u32, SocketAddr, bool)>>>,
}

impl RelayHandler for Handler {
    fn on_peer_registered(&self, id: u32, addr: SocketAddr, renewed: bool) {
        self.registered.lock().push((id, addr, renewed));
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn frame(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = BytesMut::new();
    Frame { peer_id: id, payload }.encode(&mut bytes);
    bytes.to_vec()
}

#[test]
fn test_registration_handshake() -> Result<()> {
    let relay = Relay::new(RelayOptions::default(), Handler::default());
    let mut router = relay.get_router();
    let now = Instant::now();

    let srv = addr(50001);
    let packets = router.route(&frame(SERVER_ID, &[]), srv, now)?;

    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].target, srv);
    assert_eq!(&packets[0].bytes[..], &frame(SERVER_ID, &[])[..]);
    assert_eq!(relay.peers(), vec![(SERVER_ID, srv)]);

    Ok(())
}

#[test]
fn test_client_registration_notifies_server() -> Result<()> {
    let handler = Handler::default();
    let relay = Relay::new(RelayOptions::default(), handler.clone());
    let mut router = relay.get_router();
    let now = Instant::now();

    let srv = addr(50001);
    let cli = addr(50002);

    router.route(&frame(SERVER_ID, &[]), srv, now)?;
    let packets = router.route(&frame(42, &[]), cli, now)?;

    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].target, srv);
    assert_eq!(&packets[0].bytes[..], &frame(42, &[])[..]);
    assert_eq!(packets[1].target, cli);
    assert_eq!(&packets[1].bytes[..], &frame(42, &[])[..]);

    let mut peers = relay.peers();
    peers.sort();
    assert_eq!(peers, vec![(SERVER_ID, srv), (42, cli)]);

    assert_eq!(
        handler.registered.lock().as_slice(),
        &[(SERVER_ID, srv, false), (42, cli, false)]
    );

    Ok(())
}

#[test]
fn test_client_to_server_rewrites_sender() -> Result<()> {
    let relay = Relay::new(RelayOptions::default(), Handler::default());
    let mut router = relay.get_router();
    let now = Instant::now();

    let srv = addr(50001);
    let cli = addr(50002);

    router.route(&frame(SERVER_ID, &[]), srv, now)?;
    router.route(&frame(42, &[]), cli, now)?;

    let packets = router.route(&frame(SERVER_ID, &[0xDE, 0xAD, 0xBE, 0xEF]), cli, now)?;

    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].target, srv);
    assert_eq!(
        &packets[0].bytes[..],
        &frame(42, &[0xDE, 0xAD, 0xBE, 0xEF])[..]
    );

    Ok(())
}

#[test]
fn test_server_to_client_passes_through() -> Result<()> {
    let relay = Relay::new(RelayOptions::default(), Handler::default());
    let mut router = relay.get_router();
    let now = Instant::now();

    let srv = addr(50001);
    let cli = addr(50002);

    router.route(&frame(SERVER_ID, &[]), srv, now)?;
    router.route(&frame(42, &[]), cli, now)?;

    let bytes = frame(42, &[0xCA, 0xFE, 0xBA, 0xBE]);
    let packets = router.route(&bytes, srv, now)?;

    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].target, cli);
    assert_eq!(&packets[0].bytes[..], &bytes[..]);

    Ok(())
}

#[test]
fn test_keepalive_covers_quiet_records() -> Result<()> {
    let relay = Relay::new(RelayOptions::default(), Handler::default());
    let mut router = relay.get_router();
    let now = Instant::now();

    let srv = addr(50001);
    router.route(&frame(SERVER_ID, &[]), srv, now)?;

    // Fresh records stay quiet.
    assert!(relay.keepalives(now).is_empty());

    let later = now + Duration::from_millis(1100);
    let packets = relay.keepalives(later);

    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].target, srv);
    assert_eq!(&packets[0].bytes[..], &frame(SERVER_ID, &[])[..]);

    // The tick refreshed the record, so the next scan is empty.
    assert!(relay.keepalives(later).is_empty());

    Ok(())
}

#[test]
fn test_client_before_server_is_dropped() {
    let relay = Relay::new(RelayOptions::default(), Handler::default());
    let mut router = relay.get_router();
    let now = Instant::now();

    let result = router.route(&frame(42, &[]), addr(50002), now);

    assert_eq!(result.unwrap_err(), Error::ServerNotRegistered);
    assert!(relay.peers().is_empty());
}

#[test]
fn test_unroutable_datagrams_are_dropped() -> Result<()> {
    let relay = Relay::new(RelayOptions::default(), Handler::default());
    let mut router = relay.get_router();
    let now = Instant::now();

    let srv = addr(50001);
    let cli = addr(50002);
    router.route(&frame(SERVER_ID, &[]), srv, now)?;

    // Data for an id nobody registered.
    assert_eq!(
        router.route(&frame(7, &[0x11]), srv, now).unwrap_err(),
        Error::UnknownPeer(7)
    );

    // Data toward the server from an address that never registered.
    assert_eq!(
        router
            .route(&frame(SERVER_ID, &[0x11]), cli, now)
            .unwrap_err(),
        Error::SenderNotRegistered(cli)
    );

    // Garbage is not raw traffic unless direct mode says so.
    assert!(matches!(
        router.route(&[0x01, 0x02], cli, now).unwrap_err(),
        Error::InvalidFrame(_)
    ));

    Ok(())
}

#[test]
fn test_reregistration_overwrites_address() -> Result<()> {
    let handler = Handler::default();
    let relay = Relay::new(RelayOptions::default(), handler.clone());
    let mut router = relay.get_router();
    let now = Instant::now();

    let srv = addr(50001);
    let old = addr(50002);
    let new = addr(50003);

    router.route(&frame(SERVER_ID, &[]), srv, now)?;
    router.route(&frame(42, &[]), old, now)?;
    router.route(&frame(42, &[]), new, now)?;

    assert_eq!(handler.registered.lock().last(), Some(&(42, new, true)));

    // Traffic for the id follows the newest address.
    let packets = router.route(&frame(42, &[0x11]), srv, now)?;
    assert_eq!(packets[0].target, new);

    // And the old address can no longer speak for the id.
    assert_eq!(
        router
            .route(&frame(SERVER_ID, &[0x22]), old, now)
            .unwrap_err(),
        Error::SenderNotRegistered(old)
    );

    Ok(())
}

#[test]
fn test_direct_mode_wraps_raw_traffic() -> Result<()> {
    let relay = Relay::new(RelayOptions { direct: true }, Handler::default());
    let mut router = relay.get_router();
    let now = Instant::now();

    let srv = addr(50001);
    let cli = addr(50002);

    // Raw traffic needs the server just like registrations do.
    assert_eq!(
        router.route(&[0x01, 0x02], cli, now).unwrap_err(),
        Error::ServerNotRegistered
    );

    router.route(&frame(SERVER_ID, &[]), srv, now)?;

    // First sighting: notify the server, then forward wrapped.
    let packets = router.route(&[0x01, 0x02], cli, now)?;
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].target, srv);
    assert_eq!(&packets[0].bytes[..], &frame(cli.port() as u32, &[])[..]);
    assert_eq!(packets[1].target, srv);
    assert_eq!(
        &packets[1].bytes[..],
        &frame(cli.port() as u32, &[0x01, 0x02])[..]
    );

    // Known port: no further notification.
    let packets = router.route(&[0x03], cli, now)?;
    assert_eq!(packets.len(), 1);
    assert_eq!(&packets[0].bytes[..], &frame(cli.port() as u32, &[0x03])[..]);

    // The server answers through the pseudo id; the relay unwraps.
    let packets = router.route(&frame(cli.port() as u32, &[0x0A, 0x0B]), srv, now)?;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].target, cli);
    assert_eq!(&packets[0].bytes[..], &[0x0A, 0x0B]);

    Ok(())
}
