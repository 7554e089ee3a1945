//! 릴레이 서버
//!
//! - RelayCore: 소켓 없이 메시지/데이터그램만 처리하는 상태 기계
//! - RelayServer: tokio 위에서 TCP 연결, UDP 소켓 풀, 주기 틱을 RelayCore에 연결
//!
//! RelayCore의 모든 출력은 [`Transmit`] outbox로 나가고,
//! 런타임은 호출 직후 펌프 락을 잡은 채 outbox를 비워 목적지별 순서를 지킨다.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::fragment::{DefragBoard, Fragmenter, PushResult, SenderKey};
use crate::group::GroupMembership;
use crate::member::{Member, MemberId, MemberIdPool};
use crate::message::{ClientMessage, Datagram, ServerMessage, Transmit};
use crate::socket_pool::UdpSocketPool;
use crate::traversal::TraversalCoordinator;
use crate::{Config, Error, Result};

/// 릴레이 상태 기계
pub struct RelayCore {
    config: Config,
    groups: Arc<GroupMembership>,
    ids: MemberIdPool,
    traversal: TraversalCoordinator,
    outbox: Sender<Transmit>,
    fragmenter: Fragmenter,
    defrag: Mutex<DefragBoard>,

    /// 릴레이 UDP 경로가 성립한 멤버의 외부 주소
    udp_endpoints: DashMap<SocketAddr, MemberId>,
}

impl RelayCore {
    /// 새 코어와 outbox 수신기 생성
    pub fn new(config: Config, relay_sockets: Vec<SocketAddr>) -> (Self, Receiver<Transmit>) {
        let (tx, rx) = unbounded();
        let groups = Arc::new(GroupMembership::new());
        let traversal = TraversalCoordinator::new(
            config.traversal.clone(),
            Arc::clone(&groups),
            UdpSocketPool::new(relay_sockets),
            tx.clone(),
        );

        let core = Self {
            defrag: Mutex::new(DefragBoard::new(config.fragment.clone())),
            config,
            groups,
            ids: MemberIdPool::new(),
            traversal,
            outbox: tx,
            fragmenter: Fragmenter::new(),
            udp_endpoints: DashMap::new(),
        };
        (core, rx)
    }

    pub fn groups(&self) -> &GroupMembership {
        &self.groups
    }

    pub fn traversal(&self) -> &TraversalCoordinator {
        &self.traversal
    }

    fn send(&self, to: MemberId, message: ServerMessage) {
        if self.outbox.send(Transmit::Tcp { to, message }).is_err() {
            warn!("outbox closed, dropping message to {}", to);
        }
    }

    fn send_datagram(&self, from: SocketAddr, to: SocketAddr, datagram: &Datagram) {
        let result = datagram
            .encode()
            .and_then(|bytes| self.fragmenter.split(bytes, self.config.mtu.min_mtu));
        match result {
            Ok(fragments) => {
                for fragment in fragments {
                    let _ = self.outbox.send(Transmit::Udp {
                        from,
                        to,
                        datagram: fragment,
                    });
                }
            }
            Err(e) => warn!("데이터그램 인코딩 실패: {}", e),
        }
    }

    /// 새 TCP 연결: 멤버 등록 후 Welcome
    pub fn on_connect(&self) -> MemberId {
        let id = self.ids.acquire();
        self.groups.register(Arc::new(Member::new(id)));
        info!("멤버 연결: {}", id);
        self.send(id, ServerMessage::Welcome { member: id });
        id
    }

    /// TCP 연결 종료 (멱등)
    pub fn on_disconnect(&self, id: MemberId) {
        let Some(member) = self.groups.get(id) else {
            return;
        };
        if !member.dispose() {
            return;
        }

        self.leave(id);
        self.groups.unregister(id);
        let endpoints: Vec<SocketAddr> = self
            .udp_endpoints
            .iter()
            .filter(|entry| *entry.value() == id)
            .map(|entry| *entry.key())
            .collect();
        for endpoint in endpoints {
            self.forget_endpoint(endpoint);
        }
        self.ids.release(id);
        let _ = self.outbox.send(Transmit::Close { member: id });
        info!("멤버 연결 종료: {}", id);
    }

    fn leave(&self, id: MemberId) {
        let Some((group, remaining)) = self.groups.leave(id) else {
            return;
        };
        debug!("멤버 {} 그룹 {} 이탈", id, group);
        if let Some(external) = self.traversal.on_member_left(id, &remaining) {
            self.forget_endpoint(external);
        }
    }

    /// 멤버 외부 주소 등록 해제, 그 주소의 조립 중인 조각 폐기
    fn forget_endpoint(&self, endpoint: SocketAddr) {
        self.udp_endpoints.remove(&endpoint);
        self.defrag.lock().forget_sender(SenderKey::Endpoint(endpoint));
    }

    /// 멤버 TCP 메시지 처리
    pub fn on_client_message(&self, id: MemberId, message: ClientMessage, now: Instant) {
        if self.groups.get_live(id).is_none() {
            trace!("disposed member {} message dropped", id);
            return;
        }

        match message {
            ClientMessage::JoinGroup { group } => match self.groups.join(id, group) {
                Ok(existing) => {
                    self.send(
                        id,
                        ServerMessage::JoinGroupAck {
                            group,
                            members: existing.clone(),
                        },
                    );
                    self.traversal.on_member_joined(id, &existing, now);
                }
                Err(e) => warn!("JoinGroup 거부: {}", e),
            },
            ClientMessage::LeaveGroup => self.leave(id),
            ClientMessage::P2PMemberJoinAck { peer } => {
                self.traversal.on_member_join_ack(id, peer, now);
            }
            ClientMessage::CreateUdpSocketAck { tag, local_addr } => {
                self.traversal.on_create_udp_socket_ack(id, tag, local_addr);
            }
            ClientMessage::NotifyHolepunchSuccess {
                tag,
                local,
                external,
            } => {
                if self
                    .traversal
                    .on_notify_holepunch_success(id, tag, local, external, now)
                {
                    self.udp_endpoints.insert(external, id);
                }
            }
            ClientMessage::PeerUdpNotifyHolepunchSuccess { peer, tag } => {
                self.traversal.on_peer_udp_notify_holepunch_success(id, peer, tag);
            }
            ClientMessage::NotifyP2PHolepunchSuccess {
                peer,
                tag,
                send_addr,
                recv_addr,
            } => {
                self.traversal
                    .on_notify_p2p_holepunch_success(id, peer, tag, send_addr, recv_addr, now);
            }
            ClientMessage::NotifyJitDirectP2PTriggered { peer } => {
                self.traversal.on_jit_triggered(id, peer, now);
            }
            ClientMessage::P2PNotifyDirectP2PDisconnected { peer, reason } => {
                self.traversal.on_direct_disconnected(id, peer, reason, now);
            }
            ClientMessage::RelayToPeer { to, payload } => {
                if self.groups.get_live(to).is_some() && self.groups.same_group(id, to) {
                    self.send(to, ServerMessage::RelayedFromPeer { from: id, payload });
                } else {
                    debug!("RelayToPeer 폐기: {} -> {} (같은 그룹 아님)", id, to);
                }
            }
        }
    }

    /// 릴레이 UDP 소켓 수신 처리
    pub fn on_datagram(&self, relay_socket: SocketAddr, src: SocketAddr, bytes: &[u8], now: Instant) {
        // 경로 성립 전후로 같은 주소의 조각이 섞여도 한 버퍼로 모인다
        let payload = {
            let mut defrag = self.defrag.lock();
            match defrag.push_datagram(bytes, SenderKey::Endpoint(src), now) {
                PushResult::Complete(payload) => payload,
                PushResult::Assembling => return,
                PushResult::Error(e) => {
                    trace!("잘못된 조각 from {}: {}", src, e);
                    return;
                }
            }
        };

        let datagram = match Datagram::decode(&payload) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("데이터그램 디코딩 실패 from {}: {}", src, e);
                return;
            }
        };

        match datagram {
            Datagram::ServerHolepunch { member, tag } => {
                if self.traversal.on_server_holepunch(member, tag, relay_socket) {
                    self.send_datagram(
                        relay_socket,
                        src,
                        &Datagram::ServerHolepunchAck { tag, observed: src },
                    );
                } else {
                    trace!("ServerHolepunch 거부: member {} from {}", member, src);
                }
            }
            Datagram::PeerUdpServerHolepunch {
                member,
                peer,
                tag,
                local,
            } => {
                if self
                    .traversal
                    .on_peer_udp_server_holepunch(member, peer, tag, local, src)
                {
                    self.send_datagram(
                        relay_socket,
                        src,
                        &Datagram::PeerUdpServerHolepunchAck {
                            peer,
                            tag,
                            observed: src,
                        },
                    );
                }
            }
            Datagram::ServerHolepunchAck { .. }
            | Datagram::PeerUdpServerHolepunchAck { .. }
            | Datagram::PeerHolepunch { .. }
            | Datagram::PeerHolepunchAck { .. }
            | Datagram::Ping { .. }
            | Datagram::Pong { .. }
            | Datagram::MtuProbe { .. }
            | Datagram::MtuProbeAck { .. }
            | Datagram::PeerFrame { .. }
            | Datagram::PeerUnreliable { .. } => {
                trace!("릴레이가 처리하지 않는 데이터그램 from {}", src);
            }
        }
    }

    /// 주기 틱
    pub fn tick(&self, now: Instant) {
        self.traversal.tick(now);
        self.defrag.lock().maybe_prune(now);
    }
}

/// 멤버별 TCP 송신 채널
type WriterTx = mpsc::UnboundedSender<ServerMessage>;

/// tokio 런타임 공유 상태
struct Shared {
    core: RelayCore,
    outbox: Receiver<Transmit>,
    pump_lock: Mutex<()>,
    writers: DashMap<MemberId, WriterTx>,
    sockets: HashMap<SocketAddr, Arc<UdpSocket>>,
}

impl Shared {
    /// outbox를 비워 실제 송신으로 연결
    fn pump(&self) {
        let _guard = self.pump_lock.lock();
        for transmit in self.outbox.try_iter() {
            match transmit {
                Transmit::Tcp { to, message } => match self.writers.get(&to) {
                    Some(writer) => {
                        let _ = writer.send(message);
                    }
                    None => trace!("writer 없음: {}", to),
                },
                Transmit::Udp { from, to, datagram } => self.send_udp(from, to, &datagram),
                Transmit::Close { member } => {
                    self.writers.remove(&member);
                }
            }
        }
    }

    fn send_udp(&self, from: SocketAddr, to: SocketAddr, datagram: &Bytes) {
        let Some(socket) = self.sockets.get(&from) else {
            warn!("알 수 없는 릴레이 UDP 소켓: {}", from);
            return;
        };
        if let Err(e) = socket.try_send_to(datagram, to) {
            debug!("UDP 송신 실패 {} -> {}: {}", from, to, e);
        }
    }
}

/// tokio 릴레이 서버
pub struct RelayServer {
    shared: Arc<Shared>,
    listener: TcpListener,
}

impl RelayServer {
    /// TCP 리스너와 UDP 소켓 풀 바인드
    pub async fn bind(config: Config, tcp_addr: SocketAddr, udp_addrs: &[SocketAddr]) -> Result<Self> {
        let listener = TcpListener::bind(tcp_addr).await?;

        let mut sockets = HashMap::new();
        for addr in udp_addrs {
            let socket = UdpSocket::bind(addr).await?;
            sockets.insert(socket.local_addr()?, Arc::new(socket));
        }
        let relay_sockets: Vec<SocketAddr> = sockets.keys().copied().collect();
        info!(
            "릴레이 바인드: tcp={}, udp={:?}",
            listener.local_addr()?,
            relay_sockets
        );

        let (core, outbox) = RelayCore::new(config, relay_sockets);
        Ok(Self {
            shared: Arc::new(Shared {
                core,
                outbox,
                pump_lock: Mutex::new(()),
                writers: DashMap::new(),
                sockets,
            }),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn udp_addrs(&self) -> Vec<SocketAddr> {
        self.shared.sockets.keys().copied().collect()
    }

    /// 서버 루프 (반환하지 않음)
    pub async fn run(self) -> Result<()> {
        for socket in self.shared.sockets.values() {
            tokio::spawn(udp_recv_loop(Arc::clone(&self.shared), Arc::clone(socket)));
        }
        tokio::spawn(tick_loop(Arc::clone(&self.shared)));

        loop {
            let (stream, addr) = self.listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay 실패 {}: {}", addr, e);
            }
            accept_connection(Arc::clone(&self.shared), stream, addr);
        }
    }
}

fn accept_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    // Welcome이 writer 등록 전에 펌프되지 않도록 펌프 락 안에서 등록
    let id = {
        let _guard = shared.pump_lock.lock();
        let id = shared.core.on_connect();
        shared.writers.insert(id, tx);
        id
    };
    shared.pump();
    info!("TCP 연결 {} -> member {}", addr, id);

    let max_frame_len = shared.core.config.relay.max_frame_len;
    tokio::spawn(write_loop(writer, rx, max_frame_len));
    tokio::spawn(read_loop(shared, reader, id, max_frame_len));
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, id: MemberId, max_frame_len: usize) {
    loop {
        match codec::read_frame::<_, ClientMessage>(&mut reader, max_frame_len).await {
            Ok(message) => {
                shared.core.on_client_message(id, message, Instant::now());
                shared.pump();
            }
            Err(Error::ConnectionClosed) => break,
            Err(e) if e.is_transport_fatal() => {
                warn!("member {} 전송 오류, 연결 종료: {}", id, e);
                break;
            }
            Err(e) => debug!("member {} 메시지 무시: {}", id, e),
        }
    }

    shared.core.on_disconnect(id);
    shared.pump();
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    max_frame_len: usize,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = codec::write_frame(&mut writer, &message, max_frame_len).await {
            debug!("TCP 송신 실패: {}", e);
            break;
        }
    }
}

async fn udp_recv_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let local = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("UDP 소켓 주소 조회 실패: {}", e);
            return;
        }
    };
    let mut buf = vec![0u8; 65535];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                shared.core.on_datagram(local, src, &buf[..len], Instant::now());
                shared.pump();
            }
            Err(e) => {
                // ICMP port unreachable 등은 무시하고 계속
                debug!("UDP 수신 오류 {}: {}", local, e);
            }
        }
    }
}

async fn tick_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.core.config.traversal.tick_interval);
    loop {
        interval.tick().await;
        shared.core.tick(Instant::now());
        shared.pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FRAGMENT_HEADER_LEN;
    use crate::message::{DisconnectReason, RelayPayload};

    fn core() -> (RelayCore, Receiver<Transmit>) {
        RelayCore::new(Config::default(), vec!["198.51.100.1:7000".parse().unwrap()])
    }

    fn tcp(rx: &Receiver<Transmit>) -> Vec<(MemberId, ServerMessage)> {
        rx.try_iter()
            .filter_map(|t| match t {
                Transmit::Tcp { to, message } => Some((to, message)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_join_and_relay_routing() {
        let (core, rx) = core();
        let now = Instant::now();
        let a = core.on_connect();
        let b = core.on_connect();
        let c = core.on_connect();
        assert_ne!(a, b);

        core.on_client_message(a, ClientMessage::JoinGroup { group: 1 }, now);
        core.on_client_message(b, ClientMessage::JoinGroup { group: 1 }, now);
        core.on_client_message(c, ClientMessage::JoinGroup { group: 2 }, now);
        let messages = tcp(&rx);
        assert!(messages.contains(&(a, ServerMessage::Welcome { member: a })));
        assert!(messages.contains(&(
            b,
            ServerMessage::JoinGroupAck {
                group: 1,
                members: vec![a]
            }
        )));
        assert!(messages.contains(&(a, ServerMessage::P2PMemberJoin { peer: b })));
        assert!(messages.contains(&(b, ServerMessage::P2PMemberJoin { peer: a })));

        let payload = RelayPayload::Unreliable(Bytes::from_static(b"hi"));
        core.on_client_message(
            a,
            ClientMessage::RelayToPeer {
                to: b,
                payload: payload.clone(),
            },
            now,
        );
        core.on_client_message(
            a,
            ClientMessage::RelayToPeer {
                to: c,
                payload: payload.clone(),
            },
            now,
        );
        assert_eq!(
            tcp(&rx),
            vec![(b, ServerMessage::RelayedFromPeer { from: a, payload })]
        );
    }

    #[test]
    fn test_server_holepunch_ack_over_udp() {
        let (core, rx) = core();
        let now = Instant::now();
        let a = core.on_connect();
        core.on_client_message(a, ClientMessage::JoinGroup { group: 1 }, now);

        let (relay_udp, tag) = tcp(&rx)
            .into_iter()
            .find_map(|(_, m)| match m {
                ServerMessage::RequestCreateUdpSocket { relay_udp, tag } => Some((relay_udp, tag)),
                _ => None,
            })
            .unwrap();

        let src: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let fragmenter = Fragmenter::new();
        let fragments = fragmenter
            .split(Datagram::ServerHolepunch { member: a, tag }.encode().unwrap(), 508)
            .unwrap();
        for fragment in &fragments {
            core.on_datagram(relay_udp, src, fragment, now);
        }

        let replies: Vec<Transmit> = rx.try_iter().collect();
        assert_eq!(replies.len(), 1);
        let Transmit::Udp { from, to, datagram } = &replies[0] else {
            panic!("expected udp transmit");
        };
        assert_eq!((*from, *to), (relay_udp, src));

        let mut board = DefragBoard::new(Config::default().fragment);
        let PushResult::Complete(bytes) = board.push_datagram(datagram, SenderKey::Endpoint(*from), now) else {
            panic!("single fragment expected");
        };
        assert_eq!(
            Datagram::decode(&bytes).unwrap(),
            Datagram::ServerHolepunchAck { tag, observed: src }
        );

        // 태그가 틀리면 응답 없음
        let forged = fragmenter
            .split(Datagram::ServerHolepunch { member: a, tag: tag ^ 1 }.encode().unwrap(), 508)
            .unwrap();
        core.on_datagram(relay_udp, src, &forged[0], now);
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    fn test_reassembly_spans_udp_establish() {
        let (core, rx) = core();
        let now = Instant::now();
        let a = core.on_connect();
        core.on_client_message(a, ClientMessage::JoinGroup { group: 1 }, now);
        let (relay_udp, tag) = tcp(&rx)
            .into_iter()
            .find_map(|(_, m)| match m {
                ServerMessage::RequestCreateUdpSocket { relay_udp, tag } => Some((relay_udp, tag)),
                _ => None,
            })
            .unwrap();
        let local: SocketAddr = "10.0.1.2:50000".parse().unwrap();
        let src: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        core.on_client_message(a, ClientMessage::CreateUdpSocketAck { tag, local_addr: local }, now);

        // 조각당 8바이트씩 나뉘는 펀칭 데이터그램
        let fragments = Fragmenter::new()
            .split(
                Datagram::ServerHolepunch { member: a, tag }.encode().unwrap(),
                FRAGMENT_HEADER_LEN + 8,
            )
            .unwrap();
        assert!(fragments.len() > 1);

        core.on_datagram(relay_udp, src, &fragments[0], now);
        core.on_client_message(
            a,
            ClientMessage::NotifyHolepunchSuccess {
                tag,
                local,
                external: src,
            },
            now,
        );
        assert!(core.groups().get(a).unwrap().is_udp_established());
        rx.try_iter().count();

        for fragment in &fragments[1..] {
            core.on_datagram(relay_udp, src, fragment, now);
        }
        let replies: Vec<Transmit> = rx.try_iter().collect();
        assert_eq!(replies.len(), 1);
        assert!(matches!(&replies[0], Transmit::Udp { to, .. } if *to == src));
    }

    #[test]
    fn test_disconnect_releases_member() {
        let (core, rx) = core();
        let now = Instant::now();
        let a = core.on_connect();
        let b = core.on_connect();
        core.on_client_message(a, ClientMessage::JoinGroup { group: 1 }, now);
        core.on_client_message(b, ClientMessage::JoinGroup { group: 1 }, now);
        tcp(&rx);

        core.on_disconnect(a);
        core.on_disconnect(a);
        assert_eq!(tcp(&rx), vec![(b, ServerMessage::P2PMemberLeave { peer: a })]);
        assert!(core.groups().get(a).is_none());

        // 종료된 멤버의 메시지는 무시
        core.on_client_message(
            a,
            ClientMessage::P2PNotifyDirectP2PDisconnected {
                peer: b,
                reason: DisconnectReason::Requested,
            },
            now,
        );
        assert!(tcp(&rx).is_empty());

        // 해제된 ID 재사용
        assert_eq!(core.on_connect(), a);
    }
}
