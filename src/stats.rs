//! 링크 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// RTT 샘플 보관 개수
const RTT_WINDOW: usize = 10;

/// 피어 링크 하나의 통계
#[derive(Debug, Clone)]
pub struct LinkStats {
    /// 직접 경로 송신 데이터그램 수
    pub direct_datagrams_sent: u64,

    /// 직접 경로 송신 바이트
    pub direct_bytes_sent: u64,

    /// 직접 경로 수신 바이트
    pub direct_bytes_received: u64,

    /// 릴레이 경유 송신 메시지 수
    pub relay_messages_sent: u64,

    /// 릴레이 경유 수신 메시지 수
    pub relay_messages_received: u64,

    /// 직접 링크 성립 횟수
    pub direct_established: u64,

    /// 직접 링크 상실 후 릴레이로 재전송한 메시지 수
    pub fallback_resends: u64,

    /// RTT 샘플
    rtt_samples: VecDeque<Duration>,

    /// 평활 RTT
    srtt: Option<Duration>,

    /// 마지막 직접 경로 수신 시간
    pub last_direct_receive: Option<Instant>,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStats {
    pub fn new() -> Self {
        Self {
            direct_datagrams_sent: 0,
            direct_bytes_sent: 0,
            direct_bytes_received: 0,
            relay_messages_sent: 0,
            relay_messages_received: 0,
            direct_established: 0,
            fallback_resends: 0,
            rtt_samples: VecDeque::with_capacity(RTT_WINDOW),
            srtt: None,
            last_direct_receive: None,
        }
    }

    /// 직접 경로 송신 기록
    pub fn record_direct_send(&mut self, size: usize) {
        self.direct_datagrams_sent += 1;
        self.direct_bytes_sent += size as u64;
    }

    /// 직접 경로 수신 기록
    pub fn record_direct_receive(&mut self, size: usize, now: Instant) {
        self.direct_bytes_received += size as u64;
        self.last_direct_receive = Some(now);
    }

    /// RTT 샘플 기록 (EWMA 1/8)
    pub fn record_rtt(&mut self, rtt: Duration) {
        if self.rtt_samples.len() >= RTT_WINDOW {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt);

        self.srtt = Some(match self.srtt {
            Some(prev) => (prev * 7 + rtt) / 8,
            None => rtt,
        });
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// 최근 샘플 평균 RTT
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        Some(self.rtt_samples.iter().sum::<Duration>() / self.rtt_samples.len() as u32)
    }

    /// 마지막 직접 수신 이후 경과 시간
    pub fn direct_idle(&self, now: Instant) -> Option<Duration> {
        self.last_direct_receive
            .map(|at| now.saturating_duration_since(at))
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "direct tx {} dgrams/{} bytes, rx {} bytes | relay tx {} rx {} | established {} | fallback {} | srtt {:?}",
            self.direct_datagrams_sent,
            self.direct_bytes_sent,
            self.direct_bytes_received,
            self.relay_messages_sent,
            self.relay_messages_received,
            self.direct_established,
            self.fallback_resends,
            self.srtt,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_smoothing() {
        let mut stats = LinkStats::new();
        assert!(stats.smoothed_rtt().is_none());

        stats.record_rtt(Duration::from_millis(80));
        assert_eq!(stats.smoothed_rtt(), Some(Duration::from_millis(80)));

        stats.record_rtt(Duration::from_millis(160));
        assert_eq!(stats.smoothed_rtt(), Some(Duration::from_millis(90)));
        assert_eq!(stats.average_rtt(), Some(Duration::from_millis(120)));
    }

    #[test]
    fn test_rtt_window_bounded() {
        let mut stats = LinkStats::new();
        for ms in 0..50u64 {
            stats.record_rtt(Duration::from_millis(ms));
        }
        assert_eq!(stats.average_rtt(), Some(Duration::from_micros(44_500)));
    }

    #[test]
    fn test_direct_idle() {
        let now = Instant::now();
        let mut stats = LinkStats::new();
        assert!(stats.direct_idle(now).is_none());
        stats.record_direct_receive(100, now);
        assert_eq!(stats.direct_idle(now + Duration::from_secs(2)), Some(Duration::from_secs(2)));
        assert_eq!(stats.direct_bytes_received, 100);
    }
}
