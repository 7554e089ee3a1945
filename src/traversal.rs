//! NAT 통과(홀펀칭) 조정
//!
//! 릴레이가 페어마다 다음 순서를 조율한다.
//!
//! 1. 멤버별 릴레이 UDP 경로 확보 (`RequestCreateUdpSocket` → `ServerHolepunch` → `NotifyHolepunchSuccess`)
//! 2. 페어 초기화: 재활용 가능하면 즉시 완료, 아니면 핸드쉐이크 시작
//! 3. 핸드쉐이크: 릴레이 경유 주소 갱신 → 양쪽에 서로의 주소 전달 → 양쪽 성공 보고
//! 4. 양쪽 모두 성공했을 때만 `NotifyDirectP2PEstablish` 한 번
//!
//! 실패한 페어는 [`TraversalCoordinator::tick`]이 지수 백오프로 재시도한다.
//! 두 페어 상태를 함께 바꾸는 곳은 모두 [`with_ordered_locks`]를 거친다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::config::{StartPolicy, TraversalConfig};
use crate::group::GroupMembership;
use crate::member::{Member, MemberId, RecycleInfo, UdpState};
use crate::message::{DirectLinkInfo, DisconnectReason, ServerMessage, Transmit};
use crate::pair::{with_ordered_locks, ConnectionPairState, PairLock};
use crate::socket_pool::UdpSocketPool;

/// `initialize` 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// 양쪽 UDP 또는 참가 확인이 아직 안 됨
    NotReady,

    /// 이미 초기화된 페어
    AlreadyInitialized,

    /// 이전 NAT 매핑 재사용으로 즉시 완료
    Recycled,

    /// 새 홀펀칭 핸드쉐이크 시작
    HandshakeStarted,
}

/// 페어 핸들 (멤버 두 명 + 양방향 상태)
struct PairHandles {
    a: Arc<Member>,
    b: Arc<Member>,
    lock_a: PairLock,
    lock_b: PairLock,
}

/// 틱에서 페어별로 결정한 작업
enum RetryAction {
    None,
    Start,
    Renewed { retry_count: u32 },
    RelayOnly,
}

/// 홀펀칭 조정기
pub struct TraversalCoordinator {
    config: TraversalConfig,
    groups: Arc<GroupMembership>,
    sockets: UdpSocketPool,
    outbox: Sender<Transmit>,
    rng: Mutex<StdRng>,
}

impl TraversalCoordinator {
    pub fn new(
        config: TraversalConfig,
        groups: Arc<GroupMembership>,
        sockets: UdpSocketPool,
        outbox: Sender<Transmit>,
    ) -> Self {
        Self {
            config,
            groups,
            sockets,
            outbox,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn config(&self) -> &TraversalConfig {
        &self.config
    }

    /// 재시도 대기 시간: min(base * 2^retry_count, cap)
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.config
            .retry_base
            .saturating_mul(factor)
            .min(self.config.retry_max_backoff)
    }

    fn send(&self, to: MemberId, message: ServerMessage) {
        if self.outbox.send(Transmit::Tcp { to, message }).is_err() {
            warn!("outbox closed, dropping message to {}", to);
        }
    }

    fn next_tag(&self) -> u64 {
        // 0은 "태그 없음"과 구분이 안 되므로 제외
        self.rng.lock().gen_range(1..=u64::MAX)
    }

    fn next_frame_bases(&self) -> (u32, u32) {
        let mut rng = self.rng.lock();
        (rng.gen(), rng.gen())
    }

    fn pair_handles(&self, a: MemberId, b: MemberId) -> Option<PairHandles> {
        let ma = self.groups.get_live(a)?;
        let mb = self.groups.get_live(b)?;
        let lock_a = ma.pair(b)?;
        let lock_b = mb.pair(a)?;
        Some(PairHandles {
            a: ma,
            b: mb,
            lock_a,
            lock_b,
        })
    }

    // ─────────────────────────────────────────────────────────────────
    // 릴레이 UDP 경로
    // ─────────────────────────────────────────────────────────────────

    /// 멤버에게 릴레이 UDP 소켓 준비 요청 (새 태그)
    pub fn request_udp_socket(&self, member: &Member, now: Instant) {
        if member.is_disposed() {
            return;
        }
        let Some(relay_udp) = self.sockets.pick(&mut *self.rng.lock()) else {
            warn!("릴레이 UDP 소켓 풀이 비어 있음");
            return;
        };
        let tag = self.next_tag();

        member.with_udp(|udp| {
            *udp = UdpState {
                relay_socket: Some(relay_udp),
                tag: Some(tag),
                requested_at: Some(now),
                ..UdpState::default()
            };
        });

        debug!("UDP 소켓 요청: member {} -> relay {}", member.id, relay_udp);
        self.send(member.id, ServerMessage::RequestCreateUdpSocket { relay_udp, tag });
    }

    /// 멤버가 소켓 생성 완료를 알림
    pub fn on_create_udp_socket_ack(&self, id: MemberId, tag: u64, local_addr: SocketAddr) {
        let Some(member) = self.groups.get_live(id) else {
            return;
        };
        let accepted = member.with_udp(|udp| {
            if udp.tag == Some(tag) {
                udp.local_endpoint = Some(local_addr);
                true
            } else {
                false
            }
        });
        if !accepted {
            debug!("CreateUdpSocketAck 태그 불일치: member {}", id);
        }
    }

    /// 릴레이 UDP 소켓에 도착한 `ServerHolepunch` 검증
    pub fn on_server_holepunch(
        &self,
        id: MemberId,
        tag: u64,
        relay_socket: SocketAddr,
    ) -> bool {
        let Some(member) = self.groups.get_live(id) else {
            return false;
        };
        member.with_udp(|udp| udp.tag == Some(tag) && udp.relay_socket == Some(relay_socket))
    }

    /// 릴레이 UDP 경로 성립 보고 (태그당 한 번만 수락)
    pub fn on_notify_holepunch_success(
        &self,
        id: MemberId,
        tag: u64,
        local: SocketAddr,
        external: SocketAddr,
        now: Instant,
    ) -> bool {
        let Some(member) = self.groups.get_live(id) else {
            return false;
        };

        let accepted = member.with_udp(|udp| {
            if udp.tag != Some(tag) || udp.established {
                return false;
            }
            udp.established = true;
            udp.local_endpoint = Some(local);
            udp.external_endpoint = Some(external);
            true
        });

        if !accepted {
            debug!("NotifyHolepunchSuccess 무시: member {} (태그 불일치 또는 중복)", id);
            return false;
        }

        info!("릴레이 UDP 성립: member {} local={} external={}", id, local, external);
        for peer in self.groups.peers_of(id) {
            self.maybe_start(id, peer, now);
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────
    // 그룹 참가/이탈
    // ─────────────────────────────────────────────────────────────────

    /// 그룹 참가 처리: 페어 상태 생성, 양쪽에 참가 알림, UDP 준비 요청
    pub fn on_member_joined(&self, id: MemberId, existing: &[MemberId], now: Instant) {
        let Some(member) = self.groups.get_live(id) else {
            return;
        };

        for &peer_id in existing {
            let Some(peer) = self.groups.get_live(peer_id) else {
                continue;
            };
            member.ensure_pair(peer_id);
            peer.ensure_pair(id);
            self.send(peer_id, ServerMessage::P2PMemberJoin { peer: id });
            self.send(id, ServerMessage::P2PMemberJoin { peer: peer_id });
        }

        if !member.is_udp_established() {
            self.request_udp_socket(&member, now);
        }
    }

    /// 참가 알림 확인
    pub fn on_member_join_ack(&self, id: MemberId, peer: MemberId, now: Instant) {
        let Some(member) = self.groups.get_live(id) else {
            return;
        };
        let Some(lock) = member.pair(peer) else {
            debug!("P2PMemberJoinAck: member {} has no pair with {}", id, peer);
            return;
        };
        lock.lock().joined_ack = true;
        self.maybe_start(id, peer, now);
    }

    /// 그룹 이탈 처리
    ///
    /// 페어 상태는 양쪽에서 지우고 재활용 정보와 마지막 로컬 포트는 남긴다.
    /// 이탈 멤버의 이전 외부 주소를 돌려준다.
    pub fn on_member_left(&self, id: MemberId, remaining: &[MemberId]) -> Option<SocketAddr> {
        let member = self.groups.get(id)?;

        for &peer_id in remaining {
            member.remove_pair(peer_id);
            if let Some(peer) = self.groups.get(peer_id) {
                peer.remove_pair(id);
            }
            self.send(peer_id, ServerMessage::P2PMemberLeave { peer: id });
        }

        member.with_udp(|udp| std::mem::take(udp).external_endpoint)
    }

    // ─────────────────────────────────────────────────────────────────
    // 페어 초기화
    // ─────────────────────────────────────────────────────────────────

    /// 시작 정책에 따라 초기화 시도
    pub fn maybe_start(&self, a: MemberId, b: MemberId, now: Instant) -> InitOutcome {
        if self.config.start_policy == StartPolicy::JustInTime {
            let Some(handles) = self.pair_handles(a, b) else {
                return InitOutcome::NotReady;
            };
            let both = with_ordered_locks(a, b, &handles.lock_a, &handles.lock_b, |sa, sb| {
                sa.jit_triggered && sb.jit_triggered
            })
            .unwrap_or(false);
            if !both {
                return InitOutcome::NotReady;
            }
        }
        self.initialize(a, b, now)
    }

    /// 페어 초기화 (멱등)
    pub fn initialize(&self, a: MemberId, b: MemberId, now: Instant) -> InitOutcome {
        let Some(handles) = self.pair_handles(a, b) else {
            return InitOutcome::NotReady;
        };

        // 홀펀칭 락은 페어 락보다 먼저, 따로 잡는다
        let udp_a = handles.a.udp_snapshot();
        let udp_b = handles.b.udp_snapshot();
        if !udp_a.established || !udp_b.established {
            return InitOutcome::NotReady;
        }

        let reused_a = port_reused(&udp_a, handles.a.last_good_local_port(), handles.a.recycle_info(b));
        let reused_b = port_reused(&udp_b, handles.b.last_good_local_port(), handles.b.recycle_info(a));
        let recycle_a = handles.a.recycle_info(b);
        let recycle_b = handles.b.recycle_info(a);
        let window = self.config.nat_port_recycle_reuse;
        let tag = self.next_tag();
        let bases = self.next_frame_bases();

        let outcome = with_ordered_locks(a, b, &handles.lock_a, &handles.lock_b, |sa, sb| {
            if sa.initialized && sb.initialized {
                return InitOutcome::AlreadyInitialized;
            }
            if !sa.joined_ack || !sb.joined_ack {
                return InitOutcome::NotReady;
            }

            sa.initialized = true;
            sb.initialized = true;
            sa.last_holepunch_time = Some(now);
            sb.last_holepunch_time = Some(now);
            sa.local_port_reuse_success = reused_a;
            sb.local_port_reuse_success = reused_b;

            if let (Some(info_a), Some(info_b)) = (recycle_a, recycle_b) {
                if sa.local_port_reuse_success
                    && sb.local_port_reuse_success
                    && info_a.is_fresh(now, window)
                    && info_b.is_fresh(now, window)
                {
                    self.complete_recycle(a, b, sa, sb, &info_a, &info_b, bases);
                    return InitOutcome::Recycled;
                }
            }

            self.start_handshake(a, b, sa, sb, tag);
            InitOutcome::HandshakeStarted
        })
        .unwrap_or(InitOutcome::NotReady);

        match outcome {
            InitOutcome::Recycled => info!("페어 {}-{} 재활용 완료 (홀펀칭 생략)", a, b),
            InitOutcome::HandshakeStarted => info!("페어 {}-{} 홀펀칭 시작", a, b),
            InitOutcome::NotReady | InitOutcome::AlreadyInitialized => {}
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn complete_recycle(
        &self,
        a: MemberId,
        b: MemberId,
        sa: &mut ConnectionPairState,
        sb: &mut ConnectionPairState,
        info_a: &RecycleInfo,
        info_b: &RecycleInfo,
        (base_ab, base_ba): (u32, u32),
    ) {
        for (state, info) in [(&mut *sa, info_a), (&mut *sb, info_b)] {
            state.clear_in_flight();
            state.peer_udp_holepunch_success = true;
            state.holepunch_success = true;
            state.establish_sent = true;
            state.retry_count = 0;
            state.send_addr = Some(info.send_addr);
            state.recv_addr = Some(info.recv_addr);
        }

        self.send(
            a,
            ServerMessage::P2PRecycleComplete {
                peer: b,
                recycled: true,
                link: DirectLinkInfo {
                    send_addr: info_a.send_addr,
                    recv_addr: info_a.recv_addr,
                    first_send_frame: base_ab,
                    first_recv_frame: base_ba,
                },
            },
        );
        self.send(
            b,
            ServerMessage::P2PRecycleComplete {
                peer: a,
                recycled: true,
                link: DirectLinkInfo {
                    send_addr: info_b.send_addr,
                    recv_addr: info_b.recv_addr,
                    first_send_frame: base_ba,
                    first_recv_frame: base_ab,
                },
            },
        );
    }

    fn start_handshake(
        &self,
        a: MemberId,
        b: MemberId,
        sa: &mut ConnectionPairState,
        sb: &mut ConnectionPairState,
        tag: u64,
    ) {
        for state in [&mut *sa, &mut *sb] {
            state.handshake_tag = Some(tag);
            state.new_connection_sent = true;
            state.peer_server_holepunch_ok = false;
            state.peer_udp_holepunch_success = false;
            state.local_endpoint = None;
            state.external_endpoint = None;
            state.send_addr = None;
            state.recv_addr = None;
        }
        self.send(a, ServerMessage::NewDirectP2PConnection { peer: b, tag });
        self.send(b, ServerMessage::NewDirectP2PConnection { peer: a, tag });
    }

    // ─────────────────────────────────────────────────────────────────
    // 핸드쉐이크
    // ─────────────────────────────────────────────────────────────────

    /// 릴레이 UDP에 도착한 `PeerUdpServerHolepunch`: 이번 라운드 주소 기록
    pub fn on_peer_udp_server_holepunch(
        &self,
        id: MemberId,
        peer: MemberId,
        tag: u64,
        local: SocketAddr,
        observed: SocketAddr,
    ) -> bool {
        let Some(member) = self.groups.get_live(id) else {
            return false;
        };
        let Some(lock) = member.pair(peer) else {
            return false;
        };

        let mut state = lock.lock();
        if state.handshake_tag != Some(tag) {
            trace!("PeerUdpServerHolepunch 태그 불일치: {} -> {}", id, peer);
            return false;
        }
        state.local_endpoint = Some(local);
        state.external_endpoint = Some(observed);
        true
    }

    /// 릴레이 경유 주소 갱신 완료 보고. 양쪽이 모이면 서로의 주소로 펀칭 지시
    pub fn on_peer_udp_notify_holepunch_success(&self, a: MemberId, b: MemberId, tag: u64) {
        let Some(handles) = self.pair_handles(a, b) else {
            return;
        };

        with_ordered_locks(a, b, &handles.lock_a, &handles.lock_b, |sa, sb| {
            if sa.handshake_tag != Some(tag) {
                warn!("PeerUdpNotifyHolepunchSuccess 태그 불일치: {} -> {} (protocol desync)", a, b);
                return;
            }
            if sa.peer_server_holepunch_ok {
                return;
            }
            let (Some(local_a), Some(external_a)) = (sa.local_endpoint, sa.external_endpoint) else {
                debug!("PeerUdpNotifyHolepunchSuccess before datagram: {} -> {}", a, b);
                return;
            };
            sa.peer_server_holepunch_ok = true;

            if !(sb.peer_server_holepunch_ok && sb.handshake_tag == Some(tag)) {
                return;
            }
            let (Some(local_b), Some(external_b)) = (sb.local_endpoint, sb.external_endpoint) else {
                return;
            };

            debug!(
                "펀칭 지시: {} ({} / {}) <-> {} ({} / {})",
                a, local_a, external_a, b, local_b, external_b
            );
            self.send(
                a,
                ServerMessage::RequestP2PHolepunch {
                    peer: b,
                    tag,
                    peer_local: local_b,
                    peer_external: external_b,
                },
            );
            self.send(
                b,
                ServerMessage::RequestP2PHolepunch {
                    peer: a,
                    tag,
                    peer_local: local_a,
                    peer_external: external_a,
                },
            );
        });
    }

    /// 직접 펀칭 성공 보고. 양쪽 모두 성공했을 때만 직접 연결 확정
    pub fn on_notify_p2p_holepunch_success(
        &self,
        a: MemberId,
        b: MemberId,
        tag: u64,
        send_addr: SocketAddr,
        recv_addr: SocketAddr,
        now: Instant,
    ) {
        let Some(handles) = self.pair_handles(a, b) else {
            return;
        };
        let port_a = handles.a.udp_snapshot().local_port();
        let port_b = handles.b.udp_snapshot().local_port();
        let (base_ab, base_ba) = self.next_frame_bases();

        let established = with_ordered_locks(a, b, &handles.lock_a, &handles.lock_b, |sa, sb| {
            if sa.handshake_tag != Some(tag) {
                warn!("NotifyP2PHolepunchSuccess 태그 불일치: {} -> {} (protocol desync)", a, b);
                return None;
            }
            if sa.establish_sent {
                return None;
            }
            sa.peer_udp_holepunch_success = true;
            sa.send_addr = Some(send_addr);
            sa.recv_addr = Some(recv_addr);

            if !sb.peer_udp_holepunch_success || sb.handshake_tag != Some(tag) {
                debug!("펀칭 성공 (한쪽): {} -> {}", a, b);
                return None;
            }
            let (Some(send_b), Some(recv_b)) = (sb.send_addr, sb.recv_addr) else {
                return None;
            };

            for state in [&mut *sa, &mut *sb] {
                state.holepunch_success = true;
                state.establish_sent = true;
                state.retry_count = 0;
            }

            self.send(
                a,
                ServerMessage::NotifyDirectP2PEstablish {
                    peer: b,
                    link: DirectLinkInfo {
                        send_addr,
                        recv_addr,
                        first_send_frame: base_ab,
                        first_recv_frame: base_ba,
                    },
                },
            );
            self.send(
                b,
                ServerMessage::NotifyDirectP2PEstablish {
                    peer: a,
                    link: DirectLinkInfo {
                        send_addr: send_b,
                        recv_addr: recv_b,
                        first_send_frame: base_ba,
                        first_recv_frame: base_ab,
                    },
                },
            );
            Some((send_b, recv_b))
        })
        .flatten();

        let Some((send_b, recv_b)) = established else {
            return;
        };
        info!("직접 P2P 성립: {} <-> {}", a, b);

        if let (Some(port_a), Some(port_b)) = (port_a, port_b) {
            handles.a.store_recycle_info(
                b,
                RecycleInfo {
                    send_addr,
                    recv_addr,
                    local_port: port_a,
                    established_at: now,
                },
            );
            handles.b.store_recycle_info(
                a,
                RecycleInfo {
                    send_addr: send_b,
                    recv_addr: recv_b,
                    local_port: port_b,
                    established_at: now,
                },
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // JIT / 종료
    // ─────────────────────────────────────────────────────────────────

    /// 멤버가 처음으로 피어에게 보내려 함
    pub fn on_jit_triggered(&self, a: MemberId, b: MemberId, now: Instant) {
        let Some(handles) = self.pair_handles(a, b) else {
            return;
        };

        let decision = with_ordered_locks(a, b, &handles.lock_a, &handles.lock_b, |sa, sb| {
            if sa.jit_triggered {
                return None;
            }
            sa.jit_triggered = true;
            Some(sb.jit_triggered)
        })
        .flatten();

        match decision {
            Some(false) => {
                debug!("JIT 트리거: {} -> {}, 상대 트리거 요청", a, b);
                self.send(b, ServerMessage::RequestJitDirectP2PTrigger { peer: a });
            }
            Some(true) => {
                debug!("JIT 트리거 양쪽 완료: {} <-> {}", a, b);
                self.maybe_start(a, b, now);
            }
            None => {}
        }
    }

    /// 멤버가 직접 링크 종료를 보고
    pub fn on_direct_disconnected(
        &self,
        a: MemberId,
        b: MemberId,
        reason: DisconnectReason,
        now: Instant,
    ) {
        let Some(handles) = self.pair_handles(a, b) else {
            return;
        };

        let was_direct = with_ordered_locks(a, b, &handles.lock_a, &handles.lock_b, |sa, sb| {
            let was_direct = sa.holepunch_success || sb.holepunch_success;
            for state in [&mut *sa, &mut *sb] {
                state.clear_success();
                state.last_holepunch_time = Some(now);
            }
            was_direct
        })
        .unwrap_or(false);

        // 죽은 매핑은 재활용하지 않는다
        handles.a.forget_recycle_info(b);
        handles.b.forget_recycle_info(a);

        info!("직접 P2P 종료: {} <-> {} ({:?}, was_direct={})", a, b, reason, was_direct);
        self.send(b, ServerMessage::P2PNotifyDirectP2PDisconnected2 { peer: a, reason });
    }

    // ─────────────────────────────────────────────────────────────────
    // 재시도 스케줄러
    // ─────────────────────────────────────────────────────────────────

    /// 주기 틱: UDP 준비 시간 초과 재요청 + 페어 재시도
    pub fn tick(&self, now: Instant) {
        for member in self.groups.all_members() {
            if member.is_disposed() || member.group().is_none() {
                continue;
            }

            let udp = member.udp_snapshot();
            let timed_out = !udp.established
                && udp
                    .requested_at
                    .map(|at| now.saturating_duration_since(at) >= self.config.udp_setup_timeout)
                    .unwrap_or(false);
            if timed_out {
                debug!("UDP 준비 시간 초과, 재요청: member {}", member.id);
                self.request_udp_socket(&member, now);
            }

            // 페어는 작은 ID 쪽에서 한 번만 처리
            for peer in member.peers().into_iter().filter(|peer| member.id < *peer) {
                self.tick_pair(member.id, peer, now);
            }
        }
    }

    fn tick_pair(&self, a: MemberId, b: MemberId, now: Instant) {
        let Some(handles) = self.pair_handles(a, b) else {
            return;
        };
        let tag = self.next_tag();
        let max_attempts = self.config.max_retry_attempts;

        let action = with_ordered_locks(a, b, &handles.lock_a, &handles.lock_b, |sa, sb| {
            if !sa.initialized || !sb.initialized {
                return RetryAction::Start;
            }
            if sa.holepunch_success || sa.relay_only || sb.relay_only {
                return RetryAction::None;
            }

            let retry_count = sa.retry_count.max(sb.retry_count);
            let since = sa
                .last_holepunch_time
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(Duration::MAX);
            if since < self.backoff(retry_count) {
                return RetryAction::None;
            }

            if retry_count >= max_attempts {
                sa.relay_only = true;
                sb.relay_only = true;
                sa.clear_in_flight();
                sb.clear_in_flight();
                return RetryAction::RelayOnly;
            }

            for state in [&mut *sa, &mut *sb] {
                state.clear_in_flight();
                state.retry_count = retry_count + 1;
                state.last_holepunch_time = Some(now);
            }
            self.start_handshake(a, b, sa, sb, tag);
            RetryAction::Renewed {
                retry_count: retry_count + 1,
            }
        })
        .unwrap_or(RetryAction::None);

        match action {
            RetryAction::None => {}
            RetryAction::Start => {
                self.maybe_start(a, b, now);
            }
            RetryAction::Renewed { retry_count } => {
                info!("페어 {}-{} 재시도 #{}", a, b, retry_count);
                self.send(a, ServerMessage::RenewP2PConnectionState { peer: b, retry_count });
                self.send(b, ServerMessage::RenewP2PConnectionState { peer: a, retry_count });
            }
            RetryAction::RelayOnly => {
                warn!("페어 {}-{} 재시도 한도 초과, 릴레이 전용", a, b);
                self.send(a, ServerMessage::NotifyP2PRelayOnly { peer: b });
                self.send(b, ServerMessage::NotifyP2PRelayOnly { peer: a });
            }
        }
    }
}

/// 이탈 전 마지막으로 성공한 로컬 포트를 그대로 다시 쓰는지
fn port_reused(udp: &UdpState, last_good: Option<u16>, recycle: Option<RecycleInfo>) -> bool {
    let Some(port) = udp.local_port() else {
        return false;
    };
    last_good == Some(port) && matches!(recycle, Some(info) if info.local_port == port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair::PairPhase;
    use crossbeam_channel::{unbounded, Receiver};

    const A: MemberId = MemberId(1);
    const B: MemberId = MemberId(2);

    struct Harness {
        groups: Arc<GroupMembership>,
        coordinator: TraversalCoordinator,
        rx: Receiver<Transmit>,
        start: Instant,
    }

    fn local(id: MemberId, port: u16) -> SocketAddr {
        format!("10.0.{}.2:{}", id.0, port).parse().unwrap()
    }

    fn external(id: MemberId, port: u16) -> SocketAddr {
        format!("203.0.113.{}:{}", id.0, port).parse().unwrap()
    }

    impl Harness {
        fn new(policy: StartPolicy) -> Self {
            let groups = Arc::new(GroupMembership::new());
            let (tx, rx) = unbounded();
            let config = TraversalConfig {
                start_policy: policy,
                retry_base: Duration::from_secs(1),
                retry_max_backoff: Duration::from_secs(8),
                max_retry_attempts: 2,
                ..TraversalConfig::default()
            };
            let sockets = UdpSocketPool::new(vec!["198.51.100.1:7000".parse().unwrap()]);
            let coordinator = TraversalCoordinator::new(config, Arc::clone(&groups), sockets, tx);
            Self {
                groups,
                coordinator,
                rx,
                start: Instant::now(),
            }
        }

        fn at(&self, secs: f64) -> Instant {
            self.start + Duration::from_secs_f64(secs)
        }

        fn drain(&self) -> Vec<(MemberId, ServerMessage)> {
            self.rx
                .try_iter()
                .filter_map(|t| match t {
                    Transmit::Tcp { to, message } => Some((to, message)),
                    _ => None,
                })
                .collect()
        }

        fn member(&self, id: MemberId) -> Arc<Member> {
            self.groups.get(id).unwrap()
        }

        fn state(&self, id: MemberId, peer: MemberId) -> ConnectionPairState {
            self.member(id).pair(peer).unwrap().lock().clone()
        }

        /// 멤버 참가 + 릴레이 UDP 성립 (로컬 포트 지정)
        fn join(&self, id: MemberId, port: u16, now: Instant) {
            if self.groups.get(id).is_none() {
                self.groups.register(Arc::new(Member::new(id)));
            }
            let existing = self.groups.join(id, 1).unwrap();
            self.coordinator.on_member_joined(id, &existing, now);
            self.establish_udp(id, port, now);
            for peer in existing {
                self.coordinator.on_member_join_ack(id, peer, now);
                self.coordinator.on_member_join_ack(peer, id, now);
            }
        }

        fn establish_udp(&self, id: MemberId, port: u16, now: Instant) {
            let tag = self.member(id).udp_snapshot().tag.unwrap();
            self.coordinator.on_create_udp_socket_ack(id, tag, local(id, port));
            assert!(self.coordinator.on_server_holepunch(id, tag, "198.51.100.1:7000".parse().unwrap()));
            assert!(self.coordinator.on_notify_holepunch_success(
                id,
                tag,
                local(id, port),
                external(id, port),
                now
            ));
        }

        fn handshake_tag(&self) -> u64 {
            self.state(A, B).handshake_tag.unwrap()
        }

        /// 핸드쉐이크 나머지 단계 수행
        fn complete_handshake(&self, now: Instant) {
            let tag = self.handshake_tag();
            for (me, peer) in [(A, B), (B, A)] {
                assert!(self.coordinator.on_peer_udp_server_holepunch(
                    me,
                    peer,
                    tag,
                    local(me, 4000),
                    external(me, 4000)
                ));
                self.coordinator.on_peer_udp_notify_holepunch_success(me, peer, tag);
            }
            self.coordinator
                .on_notify_p2p_holepunch_success(A, B, tag, external(B, 4000), external(A, 4000), now);
            self.coordinator
                .on_notify_p2p_holepunch_success(B, A, tag, external(A, 4000), external(B, 4000), now);
        }
    }

    fn count<F: Fn(&ServerMessage) -> bool>(messages: &[(MemberId, ServerMessage)], f: F) -> usize {
        messages.iter().filter(|(_, m)| f(m)).count()
    }

    fn is_establish(m: &ServerMessage) -> bool {
        matches!(m, ServerMessage::NotifyDirectP2PEstablish { .. })
    }

    #[test]
    fn test_eager_handshake_establishes_once() {
        let h = Harness::new(StartPolicy::Eager);
        let now = h.at(0.0);
        h.join(A, 4000, now);
        h.join(B, 4000, now);

        let messages = h.drain();
        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::NewDirectP2PConnection { .. })),
            2
        );
        assert_eq!(h.state(A, B).phase(), PairPhase::Handshaking);

        let tag = h.handshake_tag();
        for (me, peer) in [(A, B), (B, A)] {
            h.coordinator
                .on_peer_udp_server_holepunch(me, peer, tag, local(me, 4000), external(me, 4000));
            h.coordinator.on_peer_udp_notify_holepunch_success(me, peer, tag);
        }
        let messages = h.drain();
        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::RequestP2PHolepunch { .. })),
            2
        );

        // 한쪽 성공만으로는 확정하지 않는다
        h.coordinator
            .on_notify_p2p_holepunch_success(A, B, tag, external(B, 4000), external(A, 4000), now);
        h.coordinator
            .on_notify_p2p_holepunch_success(A, B, tag, external(B, 4000), external(A, 4000), now);
        assert_eq!(count(&h.drain(), is_establish), 0);
        assert_eq!(h.state(A, B).phase(), PairPhase::PeerHolepunchSucceeded);
        assert!(!h.state(B, A).holepunch_success);

        h.coordinator
            .on_notify_p2p_holepunch_success(B, A, tag, external(A, 4000), external(B, 4000), now);
        let messages = h.drain();
        assert_eq!(count(&messages, is_establish), 2);
        assert!(messages.iter().any(|(to, m)| *to == A && is_establish(m)));
        assert!(messages.iter().any(|(to, m)| *to == B && is_establish(m)));

        // 중복 보고는 무시
        h.coordinator
            .on_notify_p2p_holepunch_success(B, A, tag, external(A, 4000), external(B, 4000), now);
        assert_eq!(count(&h.drain(), is_establish), 0);

        assert_eq!(h.state(A, B).phase(), PairPhase::EstablishSent);
        assert_eq!(h.member(A).recycle_info(B).unwrap().local_port, 4000);
        assert_eq!(h.member(B).recycle_info(A).unwrap().send_addr, external(A, 4000));
    }

    #[test]
    fn test_frame_bases_mirror() {
        let h = Harness::new(StartPolicy::Eager);
        let now = h.at(0.0);
        h.join(A, 4000, now);
        h.join(B, 4000, now);
        h.complete_handshake(now);

        let links: Vec<(MemberId, DirectLinkInfo)> = h
            .drain()
            .into_iter()
            .filter_map(|(to, m)| match m {
                ServerMessage::NotifyDirectP2PEstablish { link, .. } => Some((to, link)),
                _ => None,
            })
            .collect();
        assert_eq!(links.len(), 2);
        let (_, la) = links.iter().find(|(to, _)| *to == A).unwrap();
        let (_, lb) = links.iter().find(|(to, _)| *to == B).unwrap();
        assert_eq!(la.first_send_frame, lb.first_recv_frame);
        assert_eq!(la.first_recv_frame, lb.first_send_frame);
    }

    #[test]
    fn test_mismatched_tag_dropped() {
        let h = Harness::new(StartPolicy::Eager);
        let now = h.at(0.0);
        h.join(A, 4000, now);
        h.join(B, 4000, now);
        let tag = h.handshake_tag();
        let wrong = tag.wrapping_add(1);

        assert!(!h
            .coordinator
            .on_peer_udp_server_holepunch(A, B, wrong, local(A, 4000), external(A, 4000)));
        h.coordinator
            .on_notify_p2p_holepunch_success(A, B, wrong, external(B, 4000), external(A, 4000), now);
        assert!(!h.state(A, B).peer_udp_holepunch_success);
    }

    #[test]
    fn test_not_ready_without_udp() {
        let h = Harness::new(StartPolicy::Eager);
        let now = h.at(0.0);
        h.join(A, 4000, now);

        h.groups.register(Arc::new(Member::new(B)));
        let existing = h.groups.join(B, 1).unwrap();
        h.coordinator.on_member_joined(B, &existing, now);
        h.coordinator.on_member_join_ack(A, B, now);
        h.coordinator.on_member_join_ack(B, A, now);

        assert_eq!(h.coordinator.initialize(A, B, now), InitOutcome::NotReady);
        assert_eq!(h.state(A, B).phase(), PairPhase::Uninitialized);

        h.establish_udp(B, 4000, now);
        assert_eq!(h.state(A, B).phase(), PairPhase::Handshaking);
        assert_eq!(h.coordinator.initialize(A, B, now), InitOutcome::AlreadyInitialized);
    }

    #[test]
    fn test_backoff_monotone_and_capped() {
        let h = Harness::new(StartPolicy::Eager);
        let mut prev = Duration::ZERO;
        for n in 0..40 {
            let backoff = h.coordinator.backoff(n);
            assert!(backoff >= prev);
            assert!(backoff <= Duration::from_secs(8));
            prev = backoff;
        }
        assert_eq!(h.coordinator.backoff(0), Duration::from_secs(1));
        assert_eq!(h.coordinator.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_then_relay_only() {
        let h = Harness::new(StartPolicy::Eager);
        h.join(A, 4000, h.at(0.0));
        h.join(B, 4000, h.at(0.0));
        let first_tag = h.handshake_tag();
        h.drain();

        // 백오프 전에는 아무 일도 없음
        h.coordinator.tick(h.at(0.5));
        assert!(h.drain().is_empty());

        h.coordinator.tick(h.at(1.0));
        let messages = h.drain();
        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::RenewP2PConnectionState { retry_count: 1, .. })),
            2
        );
        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::NewDirectP2PConnection { .. })),
            2
        );
        assert_ne!(h.handshake_tag(), first_tag);
        assert_eq!(h.state(B, A).retry_count, 1);

        // retry 1 → 2s 대기
        h.coordinator.tick(h.at(2.5));
        assert!(h.drain().is_empty());
        h.coordinator.tick(h.at(3.0));
        assert_eq!(h.state(A, B).retry_count, 2);
        h.drain();

        // retry 2 → 4s 후 한도 초과
        h.coordinator.tick(h.at(7.0));
        let messages = h.drain();
        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::NotifyP2PRelayOnly { .. })),
            2
        );
        assert!(h.state(A, B).relay_only);

        h.coordinator.tick(h.at(100.0));
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_retry_count_reset_after_establish() {
        let h = Harness::new(StartPolicy::Eager);
        h.join(A, 4000, h.at(0.0));
        h.join(B, 4000, h.at(0.0));
        h.coordinator.tick(h.at(1.0));
        assert_eq!(h.state(A, B).retry_count, 1);

        h.complete_handshake(h.at(1.1));
        assert_eq!(h.state(A, B).retry_count, 0);
        assert_eq!(h.state(B, A).retry_count, 0);
        assert!(h.state(A, B).holepunch_success);
    }

    fn establish_then_leave_and_rejoin(h: &Harness, rejoin_at: f64, port: u16) -> Vec<(MemberId, ServerMessage)> {
        h.join(A, 4000, h.at(0.0));
        h.join(B, 4000, h.at(0.0));
        h.complete_handshake(h.at(0.1));
        h.drain();

        let (_, remaining) = h.groups.leave(A).unwrap();
        h.coordinator.on_member_left(A, &remaining);
        assert!(h.member(B).pair(A).is_none());
        assert!(h.member(A).recycle_info(B).is_some());
        assert_eq!(h.member(A).last_good_local_port(), Some(4000));
        assert!(!h.member(A).is_udp_established());
        h.drain();

        h.join(A, port, h.at(rejoin_at));
        h.drain()
    }

    #[test]
    fn test_recycle_inside_window() {
        let h = Harness::new(StartPolicy::Eager);
        let messages = establish_then_leave_and_rejoin(&h, 30.0, 4000);

        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::P2PRecycleComplete { recycled: true, .. })),
            2
        );
        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::NewDirectP2PConnection { .. })),
            0
        );
        let state = h.state(A, B);
        assert!(state.local_port_reuse_success);
        assert_eq!(state.phase(), PairPhase::EstablishSent);
    }

    #[test]
    fn test_no_recycle_outside_window() {
        let h = Harness::new(StartPolicy::Eager);
        let messages = establish_then_leave_and_rejoin(&h, 61.0, 4000);
        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::P2PRecycleComplete { .. })),
            0
        );
        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::NewDirectP2PConnection { .. })),
            2
        );
    }

    #[test]
    fn test_no_recycle_on_new_port() {
        let h = Harness::new(StartPolicy::Eager);
        let messages = establish_then_leave_and_rejoin(&h, 5.0, 4001);
        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::P2PRecycleComplete { .. })),
            0
        );
        assert!(!h.state(A, B).local_port_reuse_success);
        assert!(h.state(B, A).local_port_reuse_success);
    }

    #[test]
    fn test_jit_requires_both_sides() {
        let h = Harness::new(StartPolicy::JustInTime);
        h.join(A, 4000, h.at(0.0));
        h.join(B, 4000, h.at(0.0));
        h.coordinator.tick(h.at(5.0));
        let messages = h.drain();
        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::NewDirectP2PConnection { .. })),
            0
        );

        h.coordinator.on_jit_triggered(A, B, h.at(6.0));
        let messages = h.drain();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], (B, ServerMessage::RequestJitDirectP2PTrigger { peer: A }));
        assert_eq!(h.state(A, B).phase(), PairPhase::Uninitialized);

        h.coordinator.on_jit_triggered(B, A, h.at(6.1));
        let messages = h.drain();
        assert_eq!(
            count(&messages, |m| matches!(m, ServerMessage::NewDirectP2PConnection { .. })),
            2
        );
    }

    #[test]
    fn test_disconnect_clears_and_retries() {
        let h = Harness::new(StartPolicy::Eager);
        h.join(A, 4000, h.at(0.0));
        h.join(B, 4000, h.at(0.0));
        h.complete_handshake(h.at(0.1));
        h.drain();

        h.coordinator
            .on_direct_disconnected(A, B, DisconnectReason::UdpTimeout, h.at(10.0));
        let messages = h.drain();
        assert_eq!(
            messages,
            vec![(
                B,
                ServerMessage::P2PNotifyDirectP2PDisconnected2 {
                    peer: A,
                    reason: DisconnectReason::UdpTimeout
                }
            )]
        );
        assert_eq!(h.state(A, B).phase(), PairPhase::Initialized);
        assert!(h.member(A).recycle_info(B).is_none());
        assert!(h.member(B).recycle_info(A).is_none());

        h.coordinator.tick(h.at(10.5));
        assert!(h.drain().is_empty());
        h.coordinator.tick(h.at(11.0));
        assert_eq!(
            count(&h.drain(), |m| matches!(m, ServerMessage::NewDirectP2PConnection { .. })),
            2
        );
    }

    #[test]
    fn test_udp_setup_timeout_rerequests() {
        let h = Harness::new(StartPolicy::Eager);
        h.groups.register(Arc::new(Member::new(A)));
        h.groups.join(A, 1).unwrap();
        h.coordinator.on_member_joined(A, &[], h.at(0.0));
        let first = h.member(A).udp_snapshot().tag.unwrap();
        h.drain();

        h.coordinator.tick(h.at(9.0));
        assert!(h.drain().is_empty());
        h.coordinator.tick(h.at(10.0));
        let messages = h.drain();
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0].1,
            ServerMessage::RequestCreateUdpSocket { tag, .. } if tag != first
        ));
    }

    #[test]
    fn test_disposed_member_ignored() {
        let h = Harness::new(StartPolicy::Eager);
        h.join(A, 4000, h.at(0.0));
        h.join(B, 4000, h.at(0.0));
        h.drain();
        h.member(B).dispose();

        let tag = h.handshake_tag();
        assert!(!h
            .coordinator
            .on_peer_udp_server_holepunch(B, A, tag, local(B, 4000), external(B, 4000)));
        h.coordinator.tick(h.at(5.0));
        assert!(h.drain().is_empty());
    }
}
