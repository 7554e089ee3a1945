//! 멤버측 세션 상태 기계
//!
//! 릴레이 TCP 메시지와 UDP 데이터그램을 받아 피어 링크별 상태를 진행시킨다.
//! 소켓을 직접 다루지 않고 [`ClientTransmit`]로 송신을, [`SessionEvent`]로
//! 애플리케이션 알림을 내보낸다.
//!
//! 피어 링크 흐름:
//! ```text
//! Relay -> ServerPunch (릴레이 UDP로 이번 라운드 주소 갱신)
//!       -> PeerPunch   (상대 외부/로컬 주소로 동시 펀칭)
//!       -> Direct      (릴레이의 Establish/RecycleComplete 수신)
//! ```
//! 직접 링크가 죽으면 ACK받지 못한 메시지를 릴레이 채널로 다시 보낸다.
//! 메시지마다 피어별 번호를 붙여, 경로가 바뀌어도 수신측은 번호 순서대로
//! 한 번씩만 애플리케이션에 넘긴다.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, trace, warn};

use crate::config::{ReliableConfig, StartPolicy};
use crate::fragment::{DefragBoard, Fragmenter, PushResult, SenderKey, FRAGMENT_HEADER_LEN};
use crate::group::GroupId;
use crate::member::MemberId;
use crate::message::{
    ClientMessage, Datagram, DirectLinkInfo, DisconnectReason, RelayPayload, ServerMessage,
};
use crate::mtu::MtuProbe;
use crate::reliable::{frame_message, ReliableChannel, ReliableFrame};
use crate::stats::LinkStats;
use crate::{Config, Error, Result};

/// PeerFrame 인코딩이 메시지에 더하는 최대 바이트 (메시지 번호 포함)
const DATAGRAM_OVERHEAD: usize = 64;

/// 메시지 번호 길이
const MESSAGE_SEQ_LEN: usize = 8;

/// 세션이 런타임에 요청하는 송신/소켓 작업
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTransmit {
    /// 릴레이 TCP로
    Tcp(ClientMessage),

    /// 현재 UDP 소켓에서 `to`로 (조각 단위)
    Udp { to: SocketAddr, datagram: Bytes },

    /// UDP 소켓 준비 (보관된 소켓이 있으면 재사용).
    /// 완료되면 [`PeerSession::on_udp_socket_opened`] 호출
    OpenUdpSocket,

    /// 현재 UDP 소켓을 재활용 레지스트리에 보관
    ParkUdpSocket,
}

/// 메시지가 도착한 경로
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Path {
    Direct,
    Relay,
}

/// 애플리케이션 알림
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        member: MemberId,
    },
    Joined {
        group: GroupId,
        members: Vec<MemberId>,
    },
    PeerJoined {
        peer: MemberId,
    },
    PeerLeft {
        peer: MemberId,
    },
    RelayUdpReady {
        local: SocketAddr,
        external: SocketAddr,
    },
    DirectP2PReady {
        peer: MemberId,
        /// false면 이전 매핑 재활용으로 홀펀칭 없이 성립
        holepunch_initiated: bool,
        local_port: Option<u16>,
        remote: SocketAddr,
    },
    DirectP2PLost {
        peer: MemberId,
        reason: DisconnectReason,
    },
    RelayOnly {
        peer: MemberId,
    },
    Message {
        from: MemberId,
        payload: Bytes,
        path: Path,
    },
    Unreliable {
        from: MemberId,
        payload: Bytes,
        path: Path,
    },
}

/// 세션 출력 채널
struct Outbox {
    transmits: Sender<ClientTransmit>,
    events: Sender<SessionEvent>,
    fragmenter: Fragmenter,
}

impl Outbox {
    fn tcp(&self, message: ClientMessage) {
        let _ = self.transmits.send(ClientTransmit::Tcp(message));
    }

    fn event(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// 데이터그램을 조각내어 송신. 보낸 바이트 수 반환
    fn udp(&self, to: SocketAddr, datagram: &Datagram, mtu: usize) -> usize {
        let fragments = match datagram.encode().and_then(|b| self.fragmenter.split(b, mtu)) {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!("데이터그램 인코딩 실패: {}", e);
                return 0;
            }
        };
        let mut sent = 0;
        for fragment in fragments {
            sent += fragment.len();
            let _ = self.transmits.send(ClientTransmit::Udp {
                to,
                datagram: fragment,
            });
        }
        sent
    }
}

/// 릴레이 UDP 경로 상태
#[derive(Debug, Default)]
struct RelayUdp {
    server: Option<SocketAddr>,
    tag: Option<u64>,
    local: Option<SocketAddr>,
    external: Option<SocketAddr>,
    ready: bool,
    opening: bool,
    last_sent: Option<Instant>,
}

/// 성립된 직접 링크
#[derive(Debug)]
struct DirectLink {
    addr: SocketAddr,
    channel: ReliableChannel,
    last_receive: Instant,
    last_ping: Option<Instant>,
    ping_seq: u32,
    ping_sent: Option<(u32, Instant)>,
}

#[derive(Debug)]
enum LinkPhase {
    Relay,
    ServerPunch {
        tag: u64,
        last_sent: Option<Instant>,
        acked: bool,
    },
    PeerPunch {
        tag: u64,
        targets: Vec<SocketAddr>,
        started: Instant,
        last_sent: Option<Instant>,
        reported: bool,
    },
    Direct(DirectLink),
}

/// 피어 하나와의 링크
#[derive(Debug)]
struct PeerLink {
    phase: LinkPhase,
    round_tag: Option<u64>,

    /// 릴레이 경유 신뢰 채널 (통과 모드)
    relay_channel: ReliableChannel,

    mtu: MtuProbe,
    stats: LinkStats,
    jit_sent: bool,
    relay_only: bool,

    /// 다음 송신 메시지 번호
    next_message_seq: u64,

    /// 다음에 전달할 수신 메시지 번호
    next_deliver_seq: u64,

    /// 번호를 앞질러 도착한 메시지
    held: BTreeMap<u64, (Bytes, Path)>,
}

impl PeerLink {
    fn new(config: &Config, now: Instant) -> Self {
        Self {
            phase: LinkPhase::Relay,
            round_tag: None,
            relay_channel: ReliableChannel::new(ReliableConfig::passthrough(), 0, 0),
            mtu: MtuProbe::new(config.mtu.clone(), now),
            stats: LinkStats::new(),
            jit_sent: false,
            relay_only: false,
            next_message_seq: 0,
            next_deliver_seq: 0,
            held: BTreeMap::new(),
        }
    }

    /// 메시지 번호를 붙여 길이 접두 프레이밍
    fn number_message(&mut self, payload: &[u8]) -> Bytes {
        let mut body = BytesMut::with_capacity(MESSAGE_SEQ_LEN + payload.len());
        body.put_u64_le(self.next_message_seq);
        body.extend_from_slice(payload);
        self.next_message_seq += 1;
        frame_message(&body)
    }

    /// 수신 메시지를 번호 순서로 정리. 이미 전달한 번호는 버린다
    fn accept_message(&mut self, message: Bytes, path: Path) -> Vec<(Bytes, Path)> {
        if message.len() < MESSAGE_SEQ_LEN {
            debug!("번호 없는 메시지 무시 ({} bytes)", message.len());
            return Vec::new();
        }
        let seq = (&message[..MESSAGE_SEQ_LEN]).get_u64_le();
        if seq < self.next_deliver_seq {
            trace!("이미 전달한 메시지 {} 무시 ({:?})", seq, path);
            return Vec::new();
        }
        self.held
            .entry(seq)
            .or_insert_with(|| (message.slice(MESSAGE_SEQ_LEN..), path));

        let mut ready = Vec::new();
        while let Some(entry) = self.held.remove(&self.next_deliver_seq) {
            ready.push(entry);
            self.next_deliver_seq += 1;
        }
        ready
    }

    fn direct(&mut self) -> Option<&mut DirectLink> {
        match &mut self.phase {
            LinkPhase::Direct(direct) => Some(direct),
            _ => None,
        }
    }

    fn is_direct(&self) -> bool {
        matches!(self.phase, LinkPhase::Direct(_))
    }

    /// 직접 링크 해제, 미확인 메시지는 릴레이 채널로
    fn drop_direct(
        &mut self,
        out: &Outbox,
        defrag: &mut DefragBoard,
        peer: MemberId,
        reason: DisconnectReason,
        notify: bool,
    ) {
        let LinkPhase::Direct(mut direct) = std::mem::replace(&mut self.phase, LinkPhase::Relay) else {
            return;
        };
        defrag.forget_sender(SenderKey::Endpoint(direct.addr));

        let unacked = direct.channel.take_unacked();
        if !unacked.is_empty() {
            debug!("피어 {} 미확인 메시지 {}개 릴레이로 재전송", peer, unacked.len());
        }
        for payload in unacked {
            self.relay_channel.send(payload);
            self.stats.fallback_resends += 1;
        }

        warn!("피어 {} 직접 링크 종료 ({:?}), 릴레이로 전환", peer, reason);
        out.event(SessionEvent::DirectP2PLost { peer, reason });
        if notify {
            out.tcp(ClientMessage::P2PNotifyDirectP2PDisconnected { peer, reason });
        }
    }
}

/// 멤버측 세션
pub struct PeerSession {
    config: Config,
    member: Option<MemberId>,
    group: Option<GroupId>,
    relay_udp: RelayUdp,
    links: HashMap<MemberId, PeerLink>,
    defrag: DefragBoard,
    out: Outbox,
}

impl PeerSession {
    /// 새 세션과 송신/이벤트 수신기 생성
    pub fn new(config: Config) -> (Self, Receiver<ClientTransmit>, Receiver<SessionEvent>) {
        let (tx, transmits) = unbounded();
        let (ev_tx, events) = unbounded();
        let session = Self {
            defrag: DefragBoard::new(config.fragment.clone()),
            config,
            member: None,
            group: None,
            relay_udp: RelayUdp::default(),
            links: HashMap::new(),
            out: Outbox {
                transmits: tx,
                events: ev_tx,
                fragmenter: Fragmenter::new(),
            },
        };
        (session, transmits, events)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn member_id(&self) -> Option<MemberId> {
        self.member
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn peers(&self) -> Vec<MemberId> {
        let mut peers: Vec<MemberId> = self.links.keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn is_direct(&self, peer: MemberId) -> bool {
        self.links.get(&peer).map(PeerLink::is_direct).unwrap_or(false)
    }

    pub fn is_relay_only(&self, peer: MemberId) -> bool {
        self.links.get(&peer).map(|l| l.relay_only).unwrap_or(false)
    }

    /// 직접 링크 상대 주소
    pub fn direct_addr(&self, peer: MemberId) -> Option<SocketAddr> {
        match &self.links.get(&peer)?.phase {
            LinkPhase::Direct(direct) => Some(direct.addr),
            _ => None,
        }
    }

    pub fn link_stats(&self, peer: MemberId) -> Option<&LinkStats> {
        self.links.get(&peer).map(|l| &l.stats)
    }

    /// 피어 링크에서 확정된 MTU
    pub fn confirmed_mtu(&self, peer: MemberId) -> Option<usize> {
        self.links.get(&peer).map(|l| l.mtu.confirmed_mtu())
    }

    /// 현재 UDP 소켓 로컬 주소
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.relay_udp.local
    }

    /// 릴레이가 관측한 외부 주소
    pub fn udp_external_addr(&self) -> Option<SocketAddr> {
        self.relay_udp.external
    }

    pub fn is_relay_udp_ready(&self) -> bool {
        self.relay_udp.ready
    }

    // ─────────────────────────────────────────────────────────────────
    // 애플리케이션 API
    // ─────────────────────────────────────────────────────────────────

    pub fn join_group(&mut self, group: GroupId) {
        info!("그룹 {} 참가 요청", group);
        self.out.tcp(ClientMessage::JoinGroup { group });
    }

    /// 그룹 이탈: 링크를 모두 버리고 UDP 소켓을 보관
    pub fn leave_group(&mut self) {
        let Some(group) = self.group.take() else {
            return;
        };
        info!("그룹 {} 이탈", group);
        self.out.tcp(ClientMessage::LeaveGroup);
        self.links.clear();

        if self.relay_udp.local.is_some() {
            let _ = self.out.transmits.send(ClientTransmit::ParkUdpSocket);
        }
        self.relay_udp = RelayUdp::default();
    }

    /// 신뢰 전송. 직접 링크가 있으면 직접, 없으면 릴레이
    pub fn send_reliable(&mut self, peer: MemberId, payload: &[u8], now: Instant) -> Result<()> {
        // 수신측 재조립 한도는 데이터그램 헤더까지 포함한 크기
        let max = self
            .config
            .fragment
            .max_message_len
            .saturating_sub(DATAGRAM_OVERHEAD);
        if payload.len() > max {
            return Err(Error::MessageTooLarge {
                len: payload.len(),
                max,
            });
        }
        let jit = self.config.traversal.start_policy == StartPolicy::JustInTime;
        let link = self.links.get_mut(&peer).ok_or(Error::UnknownPeer(peer))?;

        let framed = link.number_message(payload);
        match link.direct() {
            Some(direct) => direct.channel.send(framed),
            None => {
                link.relay_channel.send(framed);
                if jit && !link.jit_sent && !link.relay_only {
                    link.jit_sent = true;
                    self.out.tcp(ClientMessage::NotifyJitDirectP2PTriggered { peer });
                }
            }
        }

        self.flush(peer, now);
        Ok(())
    }

    /// 비신뢰 전송
    pub fn send_unreliable(&mut self, peer: MemberId, payload: Bytes) -> Result<()> {
        let me = self.member.ok_or(Error::NotConnected)?;
        let link = self.links.get_mut(&peer).ok_or(Error::UnknownPeer(peer))?;
        let mtu = link.mtu.confirmed_mtu();

        match &link.phase {
            LinkPhase::Direct(direct) => {
                let sent = self.out.udp(
                    direct.addr,
                    &Datagram::PeerUnreliable { from: me, payload },
                    mtu,
                );
                link.stats.record_direct_send(sent);
            }
            _ => {
                link.stats.relay_messages_sent += 1;
                self.out.tcp(ClientMessage::RelayToPeer {
                    to: peer,
                    payload: RelayPayload::Unreliable(payload),
                });
            }
        }
        Ok(())
    }

    /// 애플리케이션 요청으로 직접 링크 해제
    pub fn disconnect_direct(&mut self, peer: MemberId) -> Result<()> {
        let link = self.links.get_mut(&peer).ok_or(Error::UnknownPeer(peer))?;
        link.drop_direct(&self.out, &mut self.defrag, peer, DisconnectReason::Requested, true);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // 입력
    // ─────────────────────────────────────────────────────────────────

    /// 릴레이 TCP 메시지 처리
    pub fn on_server_message(&mut self, message: ServerMessage, now: Instant) {
        match message {
            ServerMessage::Welcome { member } => {
                info!("릴레이 연결 완료: {}", member);
                self.member = Some(member);
                self.out.event(SessionEvent::Connected { member });
            }
            ServerMessage::JoinGroupAck { group, members } => {
                self.group = Some(group);
                self.out.event(SessionEvent::Joined { group, members });
            }
            ServerMessage::P2PMemberJoin { peer } => {
                debug!("피어 참가: {}", peer);
                self.links
                    .entry(peer)
                    .or_insert_with(|| PeerLink::new(&self.config, now));
                self.out.tcp(ClientMessage::P2PMemberJoinAck { peer });
                self.out.event(SessionEvent::PeerJoined { peer });
            }
            ServerMessage::P2PMemberLeave { peer } => {
                if let Some(link) = self.links.remove(&peer) {
                    if let LinkPhase::Direct(direct) = &link.phase {
                        self.defrag.forget_sender(SenderKey::Endpoint(direct.addr));
                    }
                    debug!("피어 이탈: {}", peer);
                    self.out.event(SessionEvent::PeerLeft { peer });
                }
            }
            ServerMessage::RequestCreateUdpSocket { relay_udp, tag } => {
                self.on_request_udp_socket(relay_udp, tag, now);
            }
            ServerMessage::NewDirectP2PConnection { peer, tag } => {
                let Some(link) = self.links.get_mut(&peer) else {
                    return;
                };
                if link.is_direct() {
                    link.drop_direct(&self.out, &mut self.defrag, peer, DisconnectReason::Requested, false);
                }
                debug!("피어 {} 새 핸드쉐이크 라운드", peer);
                link.round_tag = Some(tag);
                link.phase = LinkPhase::ServerPunch {
                    tag,
                    last_sent: None,
                    acked: false,
                };
                self.tick_link(peer, now);
            }
            ServerMessage::RequestJitDirectP2PTrigger { peer } => {
                let Some(link) = self.links.get_mut(&peer) else {
                    return;
                };
                if !link.jit_sent {
                    link.jit_sent = true;
                    self.out.tcp(ClientMessage::NotifyJitDirectP2PTriggered { peer });
                }
            }
            ServerMessage::RequestP2PHolepunch {
                peer,
                tag,
                peer_local,
                peer_external,
            } => {
                let Some(link) = self.links.get_mut(&peer) else {
                    return;
                };
                if link.round_tag != Some(tag) {
                    debug!("RequestP2PHolepunch 태그 불일치: 피어 {}", peer);
                    return;
                }
                let mut targets = vec![peer_external];
                if peer_local != peer_external {
                    targets.push(peer_local);
                }
                debug!("피어 {} 펀칭 시작: {:?}", peer, targets);
                link.phase = LinkPhase::PeerPunch {
                    tag,
                    targets,
                    started: now,
                    last_sent: None,
                    reported: false,
                };
                self.tick_link(peer, now);
            }
            ServerMessage::NotifyDirectP2PEstablish { peer, link } => {
                self.go_direct(peer, link, true, now);
            }
            ServerMessage::P2PRecycleComplete {
                peer,
                recycled,
                link,
            } => {
                self.go_direct(peer, link, !recycled, now);
            }
            ServerMessage::P2PNotifyDirectP2PDisconnected2 { peer, reason } => {
                if let Some(link) = self.links.get_mut(&peer) {
                    link.drop_direct(&self.out, &mut self.defrag, peer, reason, false);
                    self.flush(peer, now);
                }
            }
            ServerMessage::RenewP2PConnectionState { peer, retry_count } => {
                let Some(link) = self.links.get_mut(&peer) else {
                    return;
                };
                debug!("피어 {} 연결 상태 갱신 (재시도 #{})", peer, retry_count);
                if link.is_direct() {
                    link.drop_direct(&self.out, &mut self.defrag, peer, DisconnectReason::Requested, false);
                }
                link.phase = LinkPhase::Relay;
            }
            ServerMessage::NotifyP2PRelayOnly { peer } => {
                let Some(link) = self.links.get_mut(&peer) else {
                    return;
                };
                info!("피어 {} 릴레이 전용", peer);
                link.relay_only = true;
                link.phase = LinkPhase::Relay;
                self.out.event(SessionEvent::RelayOnly { peer });
            }
            ServerMessage::RelayedFromPeer { from, payload } => {
                self.on_relayed(from, payload, now);
            }
        }
    }

    fn on_request_udp_socket(&mut self, server: SocketAddr, tag: u64, now: Instant) {
        let local = self.relay_udp.local;
        let opening = self.relay_udp.opening;
        self.relay_udp = RelayUdp {
            server: Some(server),
            tag: Some(tag),
            local,
            opening,
            ..RelayUdp::default()
        };

        match local {
            Some(local) => self.on_udp_socket_opened(local, now),
            // 이미 준비 중이면 완료 시 새 태그로 응답한다
            None if opening => {}
            None => {
                self.relay_udp.opening = true;
                let _ = self.out.transmits.send(ClientTransmit::OpenUdpSocket);
            }
        }
    }

    /// 런타임이 UDP 소켓을 준비함
    pub fn on_udp_socket_opened(&mut self, local: SocketAddr, now: Instant) {
        let Some(tag) = self.relay_udp.tag else {
            debug!("UDP 소켓 준비됐지만 요청 없음: {}", local);
            return;
        };
        self.relay_udp.opening = false;
        self.relay_udp.local = Some(local);
        debug!("UDP 소켓 준비: {}", local);
        self.out.tcp(ClientMessage::CreateUdpSocketAck {
            tag,
            local_addr: local,
        });
        self.tick_relay_udp(now);
    }

    fn on_relayed(&mut self, from: MemberId, payload: RelayPayload, now: Instant) {
        let link = self
            .links
            .entry(from)
            .or_insert_with(|| PeerLink::new(&self.config, now));

        match payload {
            RelayPayload::Reliable(frame) => {
                link.relay_channel.on_frame_received(frame, now);
                while let Some(message) = link.relay_channel.stream().try_pop_message() {
                    link.stats.relay_messages_received += 1;
                    for (payload, path) in link.accept_message(message, Path::Relay) {
                        self.out.event(SessionEvent::Message { from, payload, path });
                    }
                }
            }
            RelayPayload::Unreliable(payload) => {
                link.stats.relay_messages_received += 1;
                self.out.event(SessionEvent::Unreliable {
                    from,
                    payload,
                    path: Path::Relay,
                });
            }
        }
    }

    fn go_direct(&mut self, peer: MemberId, info: DirectLinkInfo, holepunch_initiated: bool, now: Instant) {
        let local_port = self.relay_udp.local.map(|addr| addr.port());
        let reliable = self.config.reliable.clone();
        let Some(link) = self.links.get_mut(&peer) else {
            return;
        };
        if link.is_direct() {
            link.drop_direct(&self.out, &mut self.defrag, peer, DisconnectReason::Requested, false);
        }

        link.phase = LinkPhase::Direct(DirectLink {
            addr: info.send_addr,
            channel: ReliableChannel::new(reliable, info.first_send_frame, info.first_recv_frame),
            last_receive: now,
            last_ping: None,
            ping_seq: 0,
            ping_sent: None,
        });
        link.relay_only = false;
        link.mtu.reset(now);
        link.stats.direct_established += 1;

        info!(
            "피어 {} 직접 P2P 성립: {} (holepunch={})",
            peer, info.send_addr, holepunch_initiated
        );
        self.out.event(SessionEvent::DirectP2PReady {
            peer,
            holepunch_initiated,
            local_port,
            remote: info.send_addr,
        });
    }

    /// UDP 데이터그램 수신 (조각 단위)
    pub fn on_datagram(&mut self, src: SocketAddr, bytes: &[u8], now: Instant) {
        let payload = match self.defrag.push_datagram(bytes, SenderKey::Endpoint(src), now) {
            PushResult::Complete(payload) => payload,
            PushResult::Assembling => return,
            PushResult::Error(e) => {
                trace!("잘못된 조각 from {}: {}", src, e);
                return;
            }
        };
        let datagram = match Datagram::decode(&payload) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("데이터그램 디코딩 실패 from {}: {}", src, e);
                return;
            }
        };
        let Some(me) = self.member else {
            return;
        };

        if let Some(peer) = datagram.peer_sender() {
            if let Some(link) = self.links.get_mut(&peer) {
                if let Some(direct) = link.direct() {
                    direct.last_receive = now;
                    link.stats.record_direct_receive(payload.len(), now);
                }
            }
        }

        match datagram {
            Datagram::ServerHolepunchAck { tag, observed } => {
                if self.relay_udp.server != Some(src)
                    || self.relay_udp.tag != Some(tag)
                    || self.relay_udp.ready
                {
                    return;
                }
                let Some(local) = self.relay_udp.local else {
                    return;
                };
                self.relay_udp.ready = true;
                self.relay_udp.external = Some(observed);
                info!("릴레이 UDP 준비 완료: local={} external={}", local, observed);
                self.out.tcp(ClientMessage::NotifyHolepunchSuccess {
                    tag,
                    local,
                    external: observed,
                });
                self.out.event(SessionEvent::RelayUdpReady {
                    local,
                    external: observed,
                });
            }
            Datagram::PeerUdpServerHolepunchAck { peer, tag, .. } => {
                let Some(link) = self.links.get_mut(&peer) else {
                    return;
                };
                if let LinkPhase::ServerPunch {
                    tag: current,
                    acked,
                    ..
                } = &mut link.phase
                {
                    if *current == tag && !*acked {
                        *acked = true;
                        self.out
                            .tcp(ClientMessage::PeerUdpNotifyHolepunchSuccess { peer, tag });
                    }
                }
            }
            Datagram::PeerHolepunch { from, tag } => {
                let Some(link) = self.links.get(&from) else {
                    return;
                };
                if link.round_tag == Some(tag) {
                    self.out.udp(
                        src,
                        &Datagram::PeerHolepunchAck {
                            from: me,
                            tag,
                            observed: src,
                        },
                        self.config.mtu.min_mtu,
                    );
                }
            }
            Datagram::PeerHolepunchAck { from, tag, observed } => {
                let Some(link) = self.links.get_mut(&from) else {
                    return;
                };
                if let LinkPhase::PeerPunch {
                    tag: current,
                    reported,
                    ..
                } = &mut link.phase
                {
                    if *current == tag && !*reported {
                        *reported = true;
                        debug!("피어 {} 펀칭 성공: send={} recv={}", from, src, observed);
                        self.out.tcp(ClientMessage::NotifyP2PHolepunchSuccess {
                            peer: from,
                            tag,
                            send_addr: src,
                            recv_addr: observed,
                        });
                    }
                }
            }
            Datagram::Ping { from, seq } => {
                if self.links.contains_key(&from) {
                    self.out
                        .udp(src, &Datagram::Pong { from: me, seq }, self.config.mtu.min_mtu);
                }
            }
            Datagram::Pong { from, seq } => {
                let Some(link) = self.links.get_mut(&from) else {
                    return;
                };
                let LinkPhase::Direct(direct) = &mut link.phase else {
                    return;
                };
                if let Some((sent_seq, sent_at)) = direct.ping_sent {
                    if sent_seq == seq {
                        direct.ping_sent = None;
                        link.stats.record_rtt(now.saturating_duration_since(sent_at));
                        if let Some(srtt) = link.stats.smoothed_rtt() {
                            direct.channel.set_rtt(srtt);
                        }
                    }
                }
            }
            Datagram::MtuProbe { from, seq, .. } => {
                if self.links.contains_key(&from) {
                    self.out.udp(
                        src,
                        &Datagram::MtuProbeAck { from: me, seq },
                        self.config.mtu.min_mtu,
                    );
                }
            }
            Datagram::MtuProbeAck { from, seq } => {
                if let Some(link) = self.links.get_mut(&from) {
                    link.mtu.on_ack(seq, now);
                }
            }
            Datagram::PeerFrame { from, frame } => self.on_peer_frame(from, frame, now),
            Datagram::PeerUnreliable { from, payload } => {
                if self.is_direct(from) {
                    self.out.event(SessionEvent::Unreliable {
                        from,
                        payload,
                        path: Path::Direct,
                    });
                }
            }
            Datagram::ServerHolepunch { .. } | Datagram::PeerUdpServerHolepunch { .. } => {
                trace!("멤버가 처리하지 않는 데이터그램 from {}", src);
            }
        }
    }

    fn on_peer_frame(&mut self, from: MemberId, frame: ReliableFrame, now: Instant) {
        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        let LinkPhase::Direct(direct) = &mut link.phase else {
            trace!("직접 링크 없는 피어 {}의 프레임 무시", from);
            return;
        };

        direct.channel.on_frame_received(frame, now);
        let arrived: Vec<Bytes> =
            std::iter::from_fn(|| direct.channel.stream().try_pop_message()).collect();
        for message in arrived {
            for (payload, path) in link.accept_message(message, Path::Direct) {
                self.out.event(SessionEvent::Message { from, payload, path });
            }
        }
        self.flush(from, now);
    }

    // ─────────────────────────────────────────────────────────────────
    // 틱
    // ─────────────────────────────────────────────────────────────────

    /// 주기 틱: 펀칭 재전송, ping, 타임아웃, MTU 프로브, 채널 재전송
    pub fn tick(&mut self, now: Instant) {
        self.tick_relay_udp(now);
        for peer in self.peers() {
            self.tick_link(peer, now);
        }
        self.defrag.maybe_prune(now);
    }

    fn tick_relay_udp(&mut self, now: Instant) {
        let udp = &mut self.relay_udp;
        if udp.ready {
            return;
        }
        let (Some(server), Some(tag), Some(_), Some(member)) =
            (udp.server, udp.tag, udp.local, self.member)
        else {
            return;
        };
        if !due(udp.last_sent, now, self.config.link.holepunch_interval) {
            return;
        }
        udp.last_sent = Some(now);
        trace!("ServerHolepunch -> {}", server);
        self.out.udp(
            server,
            &Datagram::ServerHolepunch { member, tag },
            self.config.mtu.min_mtu,
        );
    }

    fn tick_link(&mut self, peer: MemberId, now: Instant) {
        let Some(me) = self.member else {
            return;
        };
        let link_config = self.config.link.clone();
        let min_mtu = self.config.mtu.min_mtu;
        let relay_server = self.relay_udp.server;
        let relay_local = self.relay_udp.local;
        let relay_ready = self.relay_udp.ready;
        let Some(link) = self.links.get_mut(&peer) else {
            return;
        };

        let mut lost = false;
        match &mut link.phase {
            LinkPhase::Relay => {}
            LinkPhase::ServerPunch {
                tag,
                last_sent,
                acked,
            } => {
                if let (false, true, Some(server), Some(local)) =
                    (*acked, relay_ready, relay_server, relay_local)
                {
                    if due(*last_sent, now, link_config.holepunch_interval) {
                        *last_sent = Some(now);
                        self.out.udp(
                            server,
                            &Datagram::PeerUdpServerHolepunch {
                                member: me,
                                peer,
                                tag: *tag,
                                local,
                            },
                            min_mtu,
                        );
                    }
                }
            }
            LinkPhase::PeerPunch {
                tag,
                targets,
                started,
                last_sent,
                ..
            } => {
                if now.saturating_duration_since(*started) >= link_config.punch_timeout {
                    debug!("피어 {} 펀칭 시간 초과, 릴레이 재시도 대기", peer);
                    link.phase = LinkPhase::Relay;
                } else if due(*last_sent, now, link_config.holepunch_interval) {
                    *last_sent = Some(now);
                    for target in targets.iter() {
                        self.out
                            .udp(*target, &Datagram::PeerHolepunch { from: me, tag: *tag }, min_mtu);
                    }
                }
            }
            LinkPhase::Direct(direct) => {
                if now.saturating_duration_since(direct.last_receive) >= link_config.udp_timeout {
                    lost = true;
                } else {
                    if due(direct.last_ping, now, link_config.ping_interval) {
                        direct.last_ping = Some(now);
                        let seq = direct.ping_seq;
                        direct.ping_seq = direct.ping_seq.wrapping_add(1);
                        direct.ping_sent = Some((seq, now));
                        self.out
                            .udp(direct.addr, &Datagram::Ping { from: me, seq }, min_mtu);
                    }

                    if let Some(probe) = link.mtu.poll(now) {
                        let sent = send_mtu_probe(&self.out, direct.addr, me, probe.seq, probe.size);
                        link.stats.record_direct_send(sent);
                    }
                }
            }
        }

        if lost {
            link.drop_direct(&self.out, &mut self.defrag, peer, DisconnectReason::UdpTimeout, true);
        }
        self.flush(peer, now);
    }

    /// 채널에서 나갈 프레임을 실제 송신으로
    fn flush(&mut self, peer: MemberId, now: Instant) {
        let Some(me) = self.member else {
            return;
        };
        let Some(link) = self.links.get_mut(&peer) else {
            return;
        };

        for frame in link.relay_channel.tick(now).frames {
            link.stats.relay_messages_sent += 1;
            self.out.tcp(ClientMessage::RelayToPeer {
                to: peer,
                payload: RelayPayload::Reliable(frame),
            });
        }

        let mtu = link.mtu.confirmed_mtu();
        let failed = match &mut link.phase {
            LinkPhase::Direct(direct) => {
                let output = direct.channel.tick(now);
                for frame in output.frames {
                    let sent = self
                        .out
                        .udp(direct.addr, &Datagram::PeerFrame { from: me, frame }, mtu);
                    link.stats.record_direct_send(sent);
                }
                output.failed
            }
            _ => false,
        };

        if failed {
            link.drop_direct(
                &self.out,
                &mut self.defrag,
                peer,
                DisconnectReason::ReliableChannelFailed,
                true,
            );
            for frame in link.relay_channel.tick(now).frames {
                link.stats.relay_messages_sent += 1;
                self.out.tcp(ClientMessage::RelayToPeer {
                    to: peer,
                    payload: RelayPayload::Reliable(frame),
                });
            }
        }
    }
}

fn due(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
    last.map(|at| now.saturating_duration_since(at) >= interval)
        .unwrap_or(true)
}

/// 조각 헤더 포함 정확히 `size` 바이트인 MTU 프로브 송신
fn send_mtu_probe(out: &Outbox, to: SocketAddr, from: MemberId, seq: u32, size: usize) -> usize {
    let empty = Datagram::MtuProbe {
        from,
        seq,
        padding: Bytes::new(),
    };
    let base = match bincode::serialized_size(&empty) {
        Ok(len) => len as usize,
        Err(e) => {
            warn!("MTU 프로브 크기 계산 실패: {}", e);
            return 0;
        }
    };
    let padding = size.saturating_sub(FRAGMENT_HEADER_LEN + base);
    let probe = Datagram::MtuProbe {
        from,
        seq,
        padding: Bytes::from(vec![0u8; padding]),
    };
    trace!("MTU 프로브 {} -> {} ({} bytes)", seq, to, size);
    out.udp(to, &probe, size)
}
