//! 결정적 네트워크 시뮬레이터
//!
//! 소켓 없이 [`RelayCore`]와 여러 [`PeerSession`]을 가상 시간 위에서 돌린다.
//!
//! - 호스트 i: 사설 주소 `10.0.i.2`, 공인 주소 `203.0.113.(i+1)`
//! - 호스트마다 port-restricted NAT: 로컬 포트별 외부 포트 매핑,
//!   먼저 보낸 적 있는 원격 주소에서 온 패킷만 통과
//! - 릴레이 UDP 소켓: `198.51.100.1:7000`부터
//! - TCP는 손실 없이 순서대로, UDP는 지연/지터/손실/MTU 제한 적용
//! - 호스트 쌍 단위로 직접 UDP 경로 차단 가능

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::group::GroupId;
use crate::member::MemberId;
use crate::message::{ClientMessage, ServerMessage, Transmit};
use crate::relay::RelayCore;
use crate::session::{ClientTransmit, Path, PeerSession, SessionEvent};
use crate::socket_pool::PortRecycleRegistry;
use crate::{Config, Result};

/// 시뮬레이터 호스트 번호
pub type HostId = usize;

/// 호스트 간 UDP 링크 특성
#[derive(Debug, Clone)]
pub struct LinkProfile {
    /// 단방향 지연
    pub latency: Duration,

    /// UDP 추가 지연 최대값 (균등 분포)
    pub jitter: Duration,

    /// UDP 손실률 (0.0 ~ 1.0)
    pub loss: f64,

    /// 이보다 큰 UDP 데이터그램은 버려진다
    pub mtu: usize,
}

impl LinkProfile {
    /// 손실 없는 이상적 링크
    pub fn ideal() -> Self {
        Self {
            latency: Duration::from_millis(10),
            jitter: Duration::ZERO,
            loss: 0.0,
            mtu: 1500,
        }
    }

    /// 손실/재정렬이 있는 링크
    pub fn lossy() -> Self {
        Self {
            latency: Duration::from_millis(30),
            jitter: Duration::from_millis(10),
            loss: 0.05,
            mtu: 1400,
        }
    }
}

#[derive(Debug)]
struct NatMapping {
    external_port: u16,
    permitted: HashSet<SocketAddr>,
}

struct SimHost {
    session: PeerSession,
    transmits: Receiver<ClientTransmit>,
    session_events: Receiver<SessionEvent>,
    events: Vec<SessionEvent>,
    member: MemberId,
    private_ip: Ipv4Addr,
    public_ip: Ipv4Addr,
    socket: Option<u16>,
    parked: PortRecycleRegistry<()>,
    nat: HashMap<u16, NatMapping>,
    next_local_port: u16,
    next_external_port: u16,
}

impl SimHost {
    /// 외부 포트로 들어온 패킷이 NAT를 통과하면 로컬 포트 반환
    fn inbound(&self, external_port: u16, src: SocketAddr) -> Option<u16> {
        self.nat.iter().find_map(|(local, mapping)| {
            (mapping.external_port == external_port && mapping.permitted.contains(&src))
                .then_some(*local)
        })
    }

    /// 송신 시 NAT 매핑 생성/갱신 후 외부 주소 반환
    fn outbound(&mut self, local_port: u16, dst: SocketAddr) -> SocketAddr {
        let next_external_port = &mut self.next_external_port;
        let mapping = self.nat.entry(local_port).or_insert_with(|| {
            let external_port = *next_external_port;
            *next_external_port += 1;
            NatMapping {
                external_port,
                permitted: HashSet::new(),
            }
        });
        mapping.permitted.insert(dst);
        SocketAddr::new(IpAddr::V4(self.public_ip), mapping.external_port)
    }
}

#[derive(Debug)]
enum SimEvent {
    ToRelay {
        member: MemberId,
        message: ClientMessage,
    },
    ToHost {
        host: HostId,
        message: ServerMessage,
    },
    RelayUdp {
        relay_socket: SocketAddr,
        src: SocketAddr,
        bytes: Bytes,
    },
    HostUdp {
        host: HostId,
        external_port: u16,
        src: SocketAddr,
        bytes: Bytes,
    },
    RelayTick,
    HostTick(HostId),
}

/// 가상 네트워크
pub struct SimNetwork {
    config: Config,
    profile: LinkProfile,
    base: Instant,
    elapsed: Duration,
    queue: BTreeMap<(Duration, u64), SimEvent>,
    seq: u64,
    rng: StdRng,
    relay: RelayCore,
    relay_outbox: Receiver<Transmit>,
    relay_sockets: Vec<SocketAddr>,
    hosts: Vec<SimHost>,
    member_hosts: HashMap<MemberId, HostId>,
    blocked: HashSet<(HostId, HostId)>,
}

impl SimNetwork {
    pub fn new(config: Config, profile: LinkProfile) -> Self {
        Self::with_seed(config, profile, 7)
    }

    pub fn with_seed(config: Config, profile: LinkProfile, seed: u64) -> Self {
        let relay_sockets: Vec<SocketAddr> = (0..config.relay.udp_socket_count.max(1))
            .map(|i| SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 7000 + i as u16))
            .collect();
        let (relay, relay_outbox) = RelayCore::new(config.clone(), relay_sockets.clone());

        let mut net = Self {
            config,
            profile,
            base: Instant::now(),
            elapsed: Duration::ZERO,
            queue: BTreeMap::new(),
            seq: 0,
            rng: StdRng::seed_from_u64(seed),
            relay,
            relay_outbox,
            relay_sockets,
            hosts: Vec::new(),
            member_hosts: HashMap::new(),
            blocked: HashSet::new(),
        };
        let interval = net.config.traversal.tick_interval;
        net.schedule(interval, SimEvent::RelayTick);
        net
    }

    /// 현재 가상 시각
    pub fn now(&self) -> Instant {
        self.base + self.elapsed
    }

    /// 시작 후 경과 가상 시간
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn relay(&self) -> &RelayCore {
        &self.relay
    }

    /// 호스트 추가 (릴레이에 즉시 TCP 연결)
    pub fn add_host(&mut self) -> HostId {
        let host = self.hosts.len();
        let (session, transmits, session_events) = PeerSession::new(self.config.clone());
        let member = self.relay.on_connect();
        let index = host as u8;

        self.hosts.push(SimHost {
            session,
            transmits,
            session_events,
            events: Vec::new(),
            member,
            private_ip: Ipv4Addr::new(10, 0, index, 2),
            public_ip: Ipv4Addr::new(203, 0, 113, index.wrapping_add(1)),
            socket: None,
            parked: PortRecycleRegistry::new(self.config.relay.recycle_registry_capacity),
            nat: HashMap::new(),
            next_local_port: 50000,
            next_external_port: 40000,
        });
        self.member_hosts.insert(member, host);
        self.pump_relay();

        let interval = self.config.link.tick_interval;
        self.schedule(interval, SimEvent::HostTick(host));
        host
    }

    pub fn member(&self, host: HostId) -> MemberId {
        self.hosts[host].member
    }

    pub fn session(&self, host: HostId) -> &PeerSession {
        &self.hosts[host].session
    }

    /// 현재 UDP 소켓 로컬 포트
    pub fn udp_port(&self, host: HostId) -> Option<u16> {
        self.hosts[host].socket
    }

    pub fn join(&mut self, host: HostId, group: GroupId) {
        self.hosts[host].session.join_group(group);
        self.pump_host(host);
    }

    pub fn leave(&mut self, host: HostId) {
        self.hosts[host].session.leave_group();
        self.pump_host(host);
    }

    /// `from` 호스트에서 `to` 호스트로 신뢰 전송
    pub fn send_reliable(&mut self, from: HostId, to: HostId, payload: &[u8]) -> Result<()> {
        let peer = self.hosts[to].member;
        let now = self.now();
        let result = self.hosts[from].session.send_reliable(peer, payload, now);
        self.pump_host(from);
        result
    }

    pub fn send_unreliable(&mut self, from: HostId, to: HostId, payload: Bytes) -> Result<()> {
        let peer = self.hosts[to].member;
        let result = self.hosts[from].session.send_unreliable(peer, payload);
        self.pump_host(from);
        result
    }

    /// 두 호스트 간 직접 UDP 차단 (릴레이 경로는 유지)
    pub fn block_direct(&mut self, a: HostId, b: HostId) {
        self.blocked.insert((a.min(b), a.max(b)));
    }

    pub fn unblock_direct(&mut self, a: HostId, b: HostId) {
        self.blocked.remove(&(a.min(b), a.max(b)));
    }

    fn is_blocked(&self, a: HostId, b: HostId) -> bool {
        self.blocked.contains(&(a.min(b), a.max(b)))
    }

    /// 호스트가 받은 이벤트 전체
    pub fn events(&self, host: HostId) -> &[SessionEvent] {
        &self.hosts[host].events
    }

    /// 호스트가 받은 신뢰 메시지
    pub fn messages(&self, host: HostId) -> Vec<(MemberId, Bytes, Path)> {
        self.hosts[host]
            .events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Message {
                    from,
                    payload,
                    path,
                } => Some((*from, payload.clone(), *path)),
                _ => None,
            })
            .collect()
    }

    /// `limit` 동안 진행
    pub fn run_for(&mut self, limit: Duration) {
        self.run_until(limit, |_| false);
    }

    /// 조건이 참이 되거나 `limit`이 지날 때까지 진행. 조건 충족 여부 반환
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&SimNetwork) -> bool) -> bool {
        let deadline = self.elapsed + limit;
        loop {
            if done(self) {
                return true;
            }
            let Some((&key, _)) = self.queue.first_key_value() else {
                self.elapsed = deadline;
                return done(self);
            };
            if key.0 > deadline {
                self.elapsed = deadline;
                return done(self);
            }
            let Some((_, event)) = self.queue.pop_first() else {
                continue;
            };
            self.elapsed = key.0;
            self.dispatch(event);
        }
    }

    fn schedule(&mut self, delay: Duration, event: SimEvent) {
        self.seq += 1;
        self.queue.insert((self.elapsed + delay, self.seq), event);
    }

    fn udp_delay(&mut self) -> Duration {
        let jitter = self.profile.jitter.as_micros() as u64;
        let extra = if jitter == 0 {
            0
        } else {
            self.rng.gen_range(0..=jitter)
        };
        self.profile.latency + Duration::from_micros(extra)
    }

    /// UDP 손실/MTU 판정
    fn udp_passes(&mut self, len: usize) -> bool {
        if len > self.profile.mtu {
            trace!("sim: {} bytes > mtu {}, 폐기", len, self.profile.mtu);
            return false;
        }
        !(self.profile.loss > 0.0 && self.rng.gen_bool(self.profile.loss))
    }

    fn host_by_public_ip(&self, ip: IpAddr) -> Option<HostId> {
        self.hosts
            .iter()
            .position(|host| IpAddr::V4(host.public_ip) == ip)
    }

    fn dispatch(&mut self, event: SimEvent) {
        let now = self.now();
        match event {
            SimEvent::ToRelay { member, message } => {
                self.relay.on_client_message(member, message, now);
                self.pump_relay();
            }
            SimEvent::ToHost { host, message } => {
                self.hosts[host].session.on_server_message(message, now);
                self.pump_host(host);
            }
            SimEvent::RelayUdp {
                relay_socket,
                src,
                bytes,
            } => {
                self.relay.on_datagram(relay_socket, src, &bytes, now);
                self.pump_relay();
            }
            SimEvent::HostUdp {
                host,
                external_port,
                src,
                bytes,
            } => {
                let target = &mut self.hosts[host];
                let Some(local_port) = target.inbound(external_port, src) else {
                    trace!("sim: NAT 차단 {} -> host {}:{}", src, host, external_port);
                    return;
                };
                if target.socket != Some(local_port) {
                    trace!("sim: host {} port {} 소켓 없음", host, local_port);
                    return;
                }
                target.session.on_datagram(src, &bytes, now);
                self.pump_host(host);
            }
            SimEvent::RelayTick => {
                self.relay.tick(now);
                self.pump_relay();
                let interval = self.config.traversal.tick_interval;
                self.schedule(interval, SimEvent::RelayTick);
            }
            SimEvent::HostTick(host) => {
                self.hosts[host].session.tick(now);
                self.pump_host(host);
                let interval = self.config.link.tick_interval;
                self.schedule(interval, SimEvent::HostTick(host));
            }
        }
    }

    fn pump_relay(&mut self) {
        let transmits: Vec<Transmit> = self.relay_outbox.try_iter().collect();
        for transmit in transmits {
            match transmit {
                Transmit::Tcp { to, message } => {
                    if let Some(&host) = self.member_hosts.get(&to) {
                        let latency = self.profile.latency;
                        self.schedule(latency, SimEvent::ToHost { host, message });
                    }
                }
                Transmit::Udp { from, to, datagram } => {
                    let Some(host) = self.host_by_public_ip(to.ip()) else {
                        continue;
                    };
                    if !self.udp_passes(datagram.len()) {
                        continue;
                    }
                    let delay = self.udp_delay();
                    self.schedule(
                        delay,
                        SimEvent::HostUdp {
                            host,
                            external_port: to.port(),
                            src: from,
                            bytes: datagram,
                        },
                    );
                }
                Transmit::Close { .. } => {}
            }
        }
    }

    fn pump_host(&mut self, host: HostId) {
        loop {
            let transmits: Vec<ClientTransmit> = self.hosts[host].transmits.try_iter().collect();
            if transmits.is_empty() {
                break;
            }
            for transmit in transmits {
                self.handle_host_transmit(host, transmit);
            }
        }

        let state = &mut self.hosts[host];
        state.events.extend(state.session_events.try_iter());
    }

    fn handle_host_transmit(&mut self, host: HostId, transmit: ClientTransmit) {
        match transmit {
            ClientTransmit::Tcp(message) => {
                let member = self.hosts[host].member;
                let latency = self.profile.latency;
                self.schedule(latency, SimEvent::ToRelay { member, message });
            }
            ClientTransmit::Udp { to, datagram } => self.send_host_udp(host, to, datagram),
            ClientTransmit::OpenUdpSocket => {
                let now = self.now();
                let state = &mut self.hosts[host];
                let port = match state.parked.take_latest() {
                    Some((port, ())) => port,
                    None => {
                        let port = state.next_local_port;
                        state.next_local_port += 1;
                        port
                    }
                };
                state.socket = Some(port);
                let local = SocketAddr::new(IpAddr::V4(state.private_ip), port);
                state.session.on_udp_socket_opened(local, now);
            }
            ClientTransmit::ParkUdpSocket => {
                let state = &mut self.hosts[host];
                if let Some(port) = state.socket.take() {
                    state.parked.park(port, ());
                }
            }
        }
    }

    fn send_host_udp(&mut self, host: HostId, to: SocketAddr, datagram: Bytes) {
        let Some(local_port) = self.hosts[host].socket else {
            return;
        };
        let src = self.hosts[host].outbound(local_port, to);

        if self.relay_sockets.contains(&to) {
            if self.udp_passes(datagram.len()) {
                let delay = self.udp_delay();
                self.schedule(
                    delay,
                    SimEvent::RelayUdp {
                        relay_socket: to,
                        src,
                        bytes: datagram,
                    },
                );
            }
            return;
        }

        // 사설 주소로 보낸 패킷은 다른 NAT 뒤로 가지 못한다
        let Some(target) = self.host_by_public_ip(to.ip()) else {
            return;
        };
        if target == host || self.is_blocked(host, target) {
            return;
        }
        if !self.udp_passes(datagram.len()) {
            return;
        }
        let delay = self.udp_delay();
        self.schedule(
            delay,
            SimEvent::HostUdp {
                host: target,
                external_port: to.port(),
                src,
                bytes: datagram,
            },
        );
    }
}
