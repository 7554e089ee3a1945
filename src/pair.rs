//! 페어별 NAT 통과 진행 상태
//!
//! 멤버 A가 가진 `ConnectionPairState`는 A가 본 B와의 관계다. 상태는 항상
//! (A→B, B→A) 쌍으로 존재하며, 양쪽을 동시에 바꾸는 모든 조작은
//! [`with_ordered_locks`]를 거쳐 MemberId 오름차순으로 두 락을 잡는다.
//! 서로 반대 방향에서 같은 페어를 처리하는 두 이벤트 루프가 교착되지 않게 하는 장치다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::member::MemberId;

/// 공유 페어 상태 핸들
pub type PairLock = Arc<Mutex<ConnectionPairState>>;

/// 페어 진행 단계 (플래그에서 계산)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PairPhase {
    Uninitialized,
    Initialized,
    Handshaking,
    PeerHolepunchSucceeded,
    BothHolepunchSucceeded,
    EstablishSent,
}

/// 한쪽에서 본 페어 상태
#[derive(Debug, Clone, Default)]
pub struct ConnectionPairState {
    /// 초기화 완료 (홀펀칭 라운드 시작 가능)
    pub initialized: bool,

    /// 그룹 참가 알림을 이쪽 멤버가 확인함
    pub joined_ack: bool,

    /// 이전과 같은 로컬 UDP 포트를 다시 쓰고 있음
    pub local_port_reuse_success: bool,

    /// JIT 트리거를 이쪽 멤버가 보냄
    pub jit_triggered: bool,

    /// 이쪽 멤버가 상대에게 직접 펀칭 성공을 보고함
    pub peer_udp_holepunch_success: bool,

    /// 양방향 펀칭 성공 확정
    pub holepunch_success: bool,

    /// 이번 라운드 핸드쉐이크 시작 지시를 보냄
    pub new_connection_sent: bool,

    /// 직접 연결 확정 알림을 보냄
    pub establish_sent: bool,

    /// 재시도 횟수
    pub retry_count: u32,

    /// 마지막 홀펀칭 시작 시각
    pub last_holepunch_time: Option<Instant>,

    /// 이번 라운드 상관 토큰
    pub handshake_tag: Option<u64>,

    /// 릴레이 경유 피어 탐색 단계(PeerUdpServerHolepunch) 완료
    pub peer_server_holepunch_ok: bool,

    /// 관측된 로컬 주소
    pub local_endpoint: Option<SocketAddr>,

    /// 관측된 외부 주소
    pub external_endpoint: Option<SocketAddr>,

    /// 직접 펀칭 보고의 송신 주소 (상대에게 보낼 주소)
    pub send_addr: Option<SocketAddr>,

    /// 직접 펀칭 보고의 수신 주소 (상대가 본 내 주소)
    pub recv_addr: Option<SocketAddr>,

    /// 재시도 한도 초과로 릴레이 전용
    pub relay_only: bool,
}

impl ConnectionPairState {
    /// 현재 단계
    pub fn phase(&self) -> PairPhase {
        if !self.initialized {
            PairPhase::Uninitialized
        } else if self.establish_sent {
            PairPhase::EstablishSent
        } else if self.holepunch_success {
            PairPhase::BothHolepunchSucceeded
        } else if self.peer_udp_holepunch_success {
            PairPhase::PeerHolepunchSucceeded
        } else if self.new_connection_sent || self.jit_triggered {
            PairPhase::Handshaking
        } else {
            PairPhase::Initialized
        }
    }

    /// 진행 중인 핸드쉐이크 플래그 초기화 (재시도 전)
    pub fn clear_in_flight(&mut self) {
        self.jit_triggered = false;
        self.new_connection_sent = false;
        self.establish_sent = false;
        self.peer_server_holepunch_ok = false;
        self.peer_udp_holepunch_success = false;
        self.handshake_tag = None;
        self.local_endpoint = None;
        self.external_endpoint = None;
        self.send_addr = None;
        self.recv_addr = None;
    }

    /// 직접 링크 실패 후 성공 플래그 초기화 (initialized는 유지)
    pub fn clear_success(&mut self) {
        self.clear_in_flight();
        self.holepunch_success = false;
        self.local_port_reuse_success = false;
    }
}

/// 두 페어 락을 항상 MemberId 오름차순으로 잡고 `action` 실행
///
/// `action`에는 호출자 순서 그대로 (A 쪽 상태, B 쪽 상태)가 전달된다.
/// 같은 ID가 두 번 들어오면 같은 락을 두 번 잡게 되므로 None을 돌려준다.
pub fn with_ordered_locks<R>(
    id_a: MemberId,
    id_b: MemberId,
    lock_a: &Mutex<ConnectionPairState>,
    lock_b: &Mutex<ConnectionPairState>,
    action: impl FnOnce(&mut ConnectionPairState, &mut ConnectionPairState) -> R,
) -> Option<R> {
    if id_a == id_b {
        return None;
    }

    if id_a < id_b {
        let mut a = lock_a.lock();
        let mut b = lock_b.lock();
        Some(action(&mut a, &mut b))
    } else {
        let mut b = lock_b.lock();
        let mut a = lock_a.lock();
        Some(action(&mut a, &mut b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_phase_progression() {
        let mut state = ConnectionPairState::default();
        assert_eq!(state.phase(), PairPhase::Uninitialized);
        state.initialized = true;
        assert_eq!(state.phase(), PairPhase::Initialized);
        state.new_connection_sent = true;
        assert_eq!(state.phase(), PairPhase::Handshaking);
        state.peer_udp_holepunch_success = true;
        assert_eq!(state.phase(), PairPhase::PeerHolepunchSucceeded);
        state.holepunch_success = true;
        assert_eq!(state.phase(), PairPhase::BothHolepunchSucceeded);
        state.establish_sent = true;
        assert_eq!(state.phase(), PairPhase::EstablishSent);

        state.clear_success();
        assert_eq!(state.phase(), PairPhase::Initialized);
    }

    #[test]
    fn test_caller_order_preserved() {
        let a = Mutex::new(ConnectionPairState::default());
        let b = Mutex::new(ConnectionPairState::default());

        with_ordered_locks(MemberId(9), MemberId(2), &a, &b, |sa, sb| {
            sa.retry_count = 9;
            sb.retry_count = 2;
        });
        assert_eq!(a.lock().retry_count, 9);
        assert_eq!(b.lock().retry_count, 2);
    }

    #[test]
    fn test_same_id_rejected() {
        let a = Mutex::new(ConnectionPairState::default());
        let b = Mutex::new(ConnectionPairState::default());
        assert!(with_ordered_locks(MemberId(1), MemberId(1), &a, &b, |_, _| ()).is_none());
    }

    #[test]
    fn test_opposite_directions_do_not_deadlock() {
        const ROUNDS: usize = 20_000;

        let lock_ab: PairLock = Arc::new(Mutex::new(ConnectionPairState::default()));
        let lock_ba: PairLock = Arc::new(Mutex::new(ConnectionPairState::default()));
        let barrier = Arc::new(Barrier::new(2));

        let spawn_side = |me: MemberId, peer: MemberId, mine: PairLock, theirs: PairLock| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    with_ordered_locks(me, peer, &mine, &theirs, |m, t| {
                        m.retry_count += 1;
                        t.retry_count += 1;
                    });
                }
            })
        };

        let a = spawn_side(MemberId(1), MemberId(2), Arc::clone(&lock_ab), Arc::clone(&lock_ba));
        let b = spawn_side(MemberId(2), MemberId(1), Arc::clone(&lock_ba), Arc::clone(&lock_ab));
        a.join().unwrap();
        b.join().unwrap();

        assert_eq!(lock_ab.lock().retry_count as usize, 2 * ROUNDS);
        assert_eq!(lock_ba.lock().retry_count as usize, 2 * ROUNDS);
    }
}
