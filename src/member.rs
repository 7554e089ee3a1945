//! 멤버 식별자와 멤버별 런타임 상태
//!
//! - MemberId: 서버 프로세스 안에서 유일한 작은 정수, 해제 후 재활용
//! - Member: UDP 상태, 피어별 페어 상태, 재활용 정보

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::group::GroupId;
use crate::pair::{ConnectionPairState, PairLock};

/// 멤버 ID
///
/// 순서(`Ord`)는 페어 락 획득 순서로 쓰인다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub u32);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    next: u32,
    free: VecDeque<u32>,
    live: HashSet<u32>,
}

/// MemberId 할당 풀 (free list)
///
/// 살아있는 ID는 절대 다시 나가지 않고, 해제된 ID는 먼저 해제된 것부터 재사용한다.
#[derive(Debug, Default)]
pub struct MemberIdPool {
    inner: Mutex<PoolInner>,
}

impl MemberIdPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// ID 할당
    pub fn acquire(&self) -> MemberId {
        let mut inner = self.inner.lock();
        let id = match inner.free.pop_front() {
            Some(id) => id,
            None => {
                // 0은 예약
                inner.next += 1;
                inner.next
            }
        };
        inner.live.insert(id);
        MemberId(id)
    }

    /// ID 반환. 살아있는 ID가 아니면 false
    pub fn release(&self, id: MemberId) -> bool {
        let mut inner = self.inner.lock();
        if inner.live.remove(&id.0) {
            inner.free.push_back(id.0);
            true
        } else {
            false
        }
    }

    /// 현재 할당된 ID 수
    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }
}

/// 직전에 성공한 직접 연결의 NAT 매핑 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecycleInfo {
    /// 상대에게 보낼 때 쓴 주소
    pub send_addr: SocketAddr,

    /// 상대가 관측한 내 주소
    pub recv_addr: SocketAddr,

    /// 당시 내 로컬 UDP 포트
    pub local_port: u16,

    /// 연결 성립 시각
    pub established_at: Instant,
}

impl RecycleInfo {
    /// 재사용 허용 시간 안인지 여부
    pub fn is_fresh(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.established_at) <= window
    }
}

/// 릴레이 UDP 경로 상태 (홀펀칭 락으로 보호)
#[derive(Debug, Clone, Default)]
pub struct UdpState {
    /// 배정된 릴레이 UDP 소켓 주소
    pub relay_socket: Option<SocketAddr>,

    /// 현재 시도의 상관 토큰
    pub tag: Option<u64>,

    /// 릴레이 UDP 경로 성립 여부
    pub established: bool,

    /// 멤버가 보고한 로컬 주소
    pub local_endpoint: Option<SocketAddr>,

    /// 릴레이가 관측한 외부 주소
    pub external_endpoint: Option<SocketAddr>,

    /// 소켓 생성 요청 시각
    pub requested_at: Option<Instant>,
}

impl UdpState {
    /// 로컬 UDP 포트
    pub fn local_port(&self) -> Option<u16> {
        self.local_endpoint.map(|addr| addr.port())
    }
}

/// 멤버 런타임 레코드
#[derive(Debug)]
pub struct Member {
    pub id: MemberId,

    /// 연결 종료 표시 (예약된 콜백이 상태를 건드리기 전에 확인)
    disposed: AtomicBool,

    /// 현재 그룹
    group: Mutex<Option<GroupId>>,

    /// 홀펀칭 락
    udp: Mutex<UdpState>,

    /// 피어별 페어 상태 (내 쪽에서 본 관계)
    pairs: DashMap<MemberId, PairLock>,

    /// 피어별 재활용 정보 (이탈/재참가를 넘어 유지)
    recycle: DashMap<MemberId, RecycleInfo>,

    /// 마지막으로 성공한 로컬 UDP 포트 (이탈/재참가를 넘어 유지)
    last_good_local_port: Mutex<Option<u16>>,
}

impl Member {
    pub fn new(id: MemberId) -> Self {
        Self {
            id,
            disposed: AtomicBool::new(false),
            group: Mutex::new(None),
            udp: Mutex::new(UdpState::default()),
            pairs: DashMap::new(),
            recycle: DashMap::new(),
            last_good_local_port: Mutex::new(None),
        }
    }

    /// 종료 표시. 처음 호출에서만 true
    pub fn dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn group(&self) -> Option<GroupId> {
        *self.group.lock()
    }

    pub(crate) fn set_group(&self, group: Option<GroupId>) {
        *self.group.lock() = group;
    }

    /// 홀펀칭 락 안에서 UDP 상태 조작
    pub fn with_udp<R>(&self, f: impl FnOnce(&mut UdpState) -> R) -> R {
        f(&mut self.udp.lock())
    }

    /// UDP 상태 스냅샷
    pub fn udp_snapshot(&self) -> UdpState {
        self.udp.lock().clone()
    }

    pub fn is_udp_established(&self) -> bool {
        self.udp.lock().established
    }

    /// 피어에 대한 페어 상태 (없으면 None)
    pub fn pair(&self, peer: MemberId) -> Option<PairLock> {
        self.pairs.get(&peer).map(|entry| Arc::clone(entry.value()))
    }

    /// 피어에 대한 페어 상태 생성 (이미 있으면 기존 것)
    pub(crate) fn ensure_pair(&self, peer: MemberId) -> PairLock {
        Arc::clone(
            self.pairs
                .entry(peer)
                .or_insert_with(|| Arc::new(Mutex::new(ConnectionPairState::default())))
                .value(),
        )
    }

    pub(crate) fn remove_pair(&self, peer: MemberId) -> Option<PairLock> {
        self.pairs.remove(&peer).map(|(_, lock)| lock)
    }

    /// 페어 상태가 있는 피어 목록
    pub fn peers(&self) -> Vec<MemberId> {
        self.pairs.iter().map(|entry| *entry.key()).collect()
    }

    pub fn recycle_info(&self, peer: MemberId) -> Option<RecycleInfo> {
        self.recycle.get(&peer).map(|entry| *entry.value())
    }

    pub(crate) fn store_recycle_info(&self, peer: MemberId, info: RecycleInfo) {
        self.recycle.insert(peer, info);
        *self.last_good_local_port.lock() = Some(info.local_port);
    }

    pub(crate) fn forget_recycle_info(&self, peer: MemberId) {
        self.recycle.remove(&peer);
    }

    pub fn last_good_local_port(&self) -> Option<u16> {
        *self.last_good_local_port.lock()
    }
}
