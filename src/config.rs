//! 미들웨어 설정
//!
//! 컴포넌트별 하위 설정을 묶은 [`Config`] 하나를 릴레이와 클라이언트가 공유한다.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_MAX_MTU, DEFAULT_MIN_MTU, MAX_MESSAGE_LEN};

/// 직접 P2P 연결을 언제 시작할지 결정하는 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartPolicy {
    /// 그룹 참가 후 양쪽 UDP가 준비되면 바로 홀펀칭 시작
    Eager,

    /// 한쪽이 처음으로 상대에게 보내려 할 때 시작 (양쪽 트리거 필요)
    JustInTime,
}

/// 조각화/재조립 설정
#[derive(Debug, Clone)]
pub struct FragmentConfig {
    /// 재조립 허용 최대 메시지 크기 (바이트)
    pub max_message_len: usize,

    /// 미완성 조립 버퍼 폐기 기준 시간
    pub stale_after: Duration,

    /// 오래된 조립 버퍼 정리 주기
    pub prune_interval: Duration,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            max_message_len: MAX_MESSAGE_LEN,
            stale_after: Duration::from_secs(5),
            prune_interval: Duration::from_secs(1),
        }
    }
}

/// 신뢰 채널(ARQ) 설정
#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// 이미 신뢰성 있는 전송(TCP 릴레이) 위에서 동작하는지 여부
    /// true면 재전송/ACK를 하지 않고 프레임을 그대로 통과시킨다
    pub passthrough: bool,

    /// RTT 측정값이 없을 때 사용할 기본 RTT
    pub default_rtt: Duration,

    /// 최소 재전송 타임아웃
    pub min_rto: Duration,

    /// 최대 재전송 타임아웃
    pub max_rto: Duration,

    /// 단일 프레임 최대 재전송 횟수 (초과 시 채널 실패)
    pub max_retransmits: u32,

    /// 동시에 ACK 대기할 수 있는 최대 프레임 수
    pub send_window: usize,

    /// 순서가 어긋난 프레임을 버퍼링할 최대 거리
    pub recv_window: u32,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            passthrough: false,
            default_rtt: Duration::from_millis(200),
            min_rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(3),
            max_retransmits: 10,
            send_window: 256,
            recv_window: 1024,
        }
    }
}

impl ReliableConfig {
    /// 릴레이(TCP) 경유 통과 모드 설정
    pub fn passthrough() -> Self {
        Self {
            passthrough: true,
            ..Self::default()
        }
    }
}

/// MTU 탐색 설정
#[derive(Debug, Clone)]
pub struct MtuConfig {
    /// 하한 (항상 통과한다고 가정하는 크기)
    pub min_mtu: usize,

    /// 상한
    pub max_mtu: usize,

    /// 첫 증가 폭
    pub initial_step: usize,

    /// 최소 증가 폭 (이보다 작은 간격이 남으면 수렴으로 판단)
    pub min_step: usize,

    /// 프로브 전송 간격
    pub probe_interval: Duration,

    /// 프로브 응답 대기 시간
    pub probe_timeout: Duration,

    /// 같은 크기에서 연속 실패 허용 횟수
    pub max_failures_per_size: u32,

    /// 이 시간 동안 증가가 없으면 탐색 완료
    pub stability_window: Duration,

    /// 탐색 완료 후 더 큰 크기를 다시 시도하기까지의 시간
    pub retry_larger_after: Duration,
}

impl Default for MtuConfig {
    fn default() -> Self {
        Self {
            min_mtu: DEFAULT_MIN_MTU,
            max_mtu: DEFAULT_MAX_MTU,
            initial_step: 256,
            min_step: 16,
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(500),
            max_failures_per_size: 3,
            stability_window: Duration::from_secs(3),
            retry_larger_after: Duration::from_secs(60),
        }
    }
}

/// NAT 통과(홀펀칭) 조정 설정 (릴레이측)
#[derive(Debug, Clone)]
pub struct TraversalConfig {
    /// 시작 정책
    pub start_policy: StartPolicy,

    /// 재시도 기본 대기 시간 (base * 2^retry_count)
    pub retry_base: Duration,

    /// 재시도 대기 시간 상한
    pub retry_max_backoff: Duration,

    /// 최대 재시도 횟수 (초과 시 릴레이 전용 상태)
    pub max_retry_attempts: u32,

    /// 이전 NAT 매핑 재사용 허용 시간 (NatPortRecycleReuseSeconds)
    pub nat_port_recycle_reuse: Duration,

    /// 멤버 UDP 소켓 준비 제한 시간 (초과 시 새 태그로 재요청)
    pub udp_setup_timeout: Duration,

    /// 재시도 스케줄러 주기
    pub tick_interval: Duration,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            start_policy: StartPolicy::Eager,
            retry_base: Duration::from_secs(2),
            retry_max_backoff: Duration::from_secs(30),
            max_retry_attempts: 5,
            nat_port_recycle_reuse: Duration::from_secs(60),
            udp_setup_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(300),
        }
    }
}

/// 클라이언트측 링크 유지 설정
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// 홀펀칭 패킷 재전송 간격
    pub holepunch_interval: Duration,

    /// 피어 홀펀칭 시도 제한 시간
    pub punch_timeout: Duration,

    /// UDP ping 간격
    pub ping_interval: Duration,

    /// 이 시간 동안 UDP 수신이 없으면 직접 링크 종료로 판단
    pub udp_timeout: Duration,

    /// 클라이언트 틱 주기
    pub tick_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            holepunch_interval: Duration::from_millis(200),
            punch_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            udp_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(20),
        }
    }
}

/// 릴레이 서버 런타임 설정
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// 릴레이 UDP 소켓 수 (멤버별로 무작위 배정)
    pub udp_socket_count: usize,

    /// TCP 프레임 최대 크기
    pub max_frame_len: usize,

    /// 클라이언트가 보관할 재활용 소켓 최대 수
    pub recycle_registry_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            udp_socket_count: 4,
            max_frame_len: MAX_MESSAGE_LEN + 64 * 1024,
            recycle_registry_capacity: 16,
        }
    }
}

/// 전체 설정
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub fragment: FragmentConfig,
    pub reliable: ReliableConfig,
    pub mtu: MtuConfig,
    pub traversal: TraversalConfig,
    pub link: LinkConfig,
    pub relay: RelayConfig,
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 지연이 낮은 LAN/데이터센터용 설정
    pub fn low_latency() -> Self {
        let mut config = Self::default();
        config.reliable.default_rtt = Duration::from_millis(20);
        config.reliable.min_rto = Duration::from_millis(30);
        config.reliable.max_rto = Duration::from_millis(800);
        config.mtu.probe_interval = Duration::from_millis(50);
        config.mtu.probe_timeout = Duration::from_millis(150);
        config.traversal.retry_base = Duration::from_millis(500);
        config.traversal.retry_max_backoff = Duration::from_secs(8);
        config.traversal.tick_interval = Duration::from_millis(100);
        config.link.holepunch_interval = Duration::from_millis(50);
        config.link.punch_timeout = Duration::from_secs(2);
        config.link.ping_interval = Duration::from_millis(250);
        config.link.udp_timeout = Duration::from_secs(2);
        config.link.tick_interval = Duration::from_millis(10);
        config
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        let mut config = Self::default();
        config.fragment.stale_after = Duration::from_secs(15);
        config.reliable.default_rtt = Duration::from_millis(400);
        config.reliable.max_rto = Duration::from_secs(5);
        config.reliable.max_retransmits = 16;
        config.mtu.max_failures_per_size = 5;
        config.mtu.probe_timeout = Duration::from_secs(1);
        config.traversal.retry_base = Duration::from_secs(3);
        config.traversal.retry_max_backoff = Duration::from_secs(60);
        config.traversal.max_retry_attempts = 8;
        config.link.punch_timeout = Duration::from_secs(10);
        config.link.udp_timeout = Duration::from_secs(10);
        config
    }

    /// 조각 하나에 실을 수 있는 최대 페이로드
    pub fn fragment_payload_len(mtu: usize) -> usize {
        mtu.saturating_sub(crate::fragment::FRAGMENT_HEADER_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_keep_mtu_bounds() {
        for config in [Config::default(), Config::low_latency(), Config::unstable_network()] {
            assert!(config.mtu.min_mtu <= config.mtu.max_mtu);
            assert!(config.reliable.min_rto <= config.reliable.max_rto);
            assert!(config.traversal.retry_base <= config.traversal.retry_max_backoff);
        }
    }

    #[test]
    fn test_passthrough_preset() {
        let reliable = ReliableConfig::passthrough();
        assert!(reliable.passthrough);
        assert_eq!(reliable.max_retransmits, ReliableConfig::default().max_retransmits);
    }
}
