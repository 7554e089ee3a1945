//! 루프백 주소에서 실제 소켓으로 릴레이와 클라이언트 두 개를 돌린다

use std::net::SocketAddr;
use std::time::Duration;

use relaypunch::{Config, MemberId, PeerClient, RelayServer, SessionEvent};
use tokio::time::timeout;

async fn start_relay(config: Config) -> SocketAddr {
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = RelayServer::bind(config, any, &[any]).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

/// 조건에 맞는 이벤트가 올 때까지 대기
async fn wait_for<F>(client: &mut PeerClient, mut matches: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let event = client.next_event().await.expect("relay connection closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn connected(client: &mut PeerClient) -> MemberId {
    match wait_for(client, |e| matches!(e, SessionEvent::Connected { .. })).await {
        SessionEvent::Connected { member } => member,
        _ => unreachable!(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loopback_direct_and_message() {
    let config = Config::low_latency();
    let relay = start_relay(config.clone()).await;

    let mut a = PeerClient::connect(config.clone(), relay).await.unwrap();
    let mut b = PeerClient::connect(config, relay).await.unwrap();
    let id_a = connected(&mut a).await;
    let id_b = connected(&mut b).await;
    assert_ne!(id_a, id_b);

    a.join(1);
    b.join(1);
    wait_for(&mut a, |e| matches!(e, SessionEvent::PeerJoined { peer } if *peer == id_b)).await;

    a.send(id_b, b"hello over loopback").unwrap();
    let event = wait_for(&mut b, |e| matches!(e, SessionEvent::Message { .. })).await;
    let SessionEvent::Message { from, payload, .. } = event else {
        unreachable!();
    };
    assert_eq!(from, id_a);
    assert_eq!(payload.as_ref(), b"hello over loopback");

    // 루프백에서는 NAT가 없으므로 직접 경로가 성립해야 한다
    wait_for(&mut a, |e| matches!(e, SessionEvent::DirectP2PReady { peer, .. } if *peer == id_b)).await;
    assert!(a.is_direct(id_b));
    assert!(a.udp_port().is_some());

    a.close();
    b.close();
}

#[tokio::test]
async fn test_leave_keeps_udp_port_for_rejoin() {
    let config = Config::low_latency();
    let relay = start_relay(config.clone()).await;

    let mut a = PeerClient::connect(config, relay).await.unwrap();
    connected(&mut a).await;
    a.join(3);
    wait_for(&mut a, |e| matches!(e, SessionEvent::RelayUdpReady { .. })).await;
    let first_port = a.udp_port();
    assert!(first_port.is_some());

    a.leave();
    assert!(a.udp_port().is_none());

    a.join(3);
    wait_for(&mut a, |e| matches!(e, SessionEvent::RelayUdpReady { .. })).await;
    assert_eq!(a.udp_port(), first_port);
}
