//! 링크별 MTU 탐색
//!
//! 하한(min_mtu)에서 시작해 step씩 키워가며 프로브를 보낸다.
//! 같은 크기에서 연속 실패가 쌓이면 상한을 그 아래로 내리고 step을 절반으로 줄인다.
//! 한 번 수렴하면 완료 상태는 `reset` 전까지 유지되고, `retry_larger_after`마다
//! 더 큰 크기를 다시 시도한다.

use std::time::Instant;

use tracing::{debug, trace};

use crate::config::MtuConfig;

/// 보낼 프로브
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    pub seq: u32,
    /// UDP 데이터그램 전체 크기
    pub size: usize,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    seq: u32,
    size: usize,
    sent_at: Instant,
}

/// MTU 탐색기
#[derive(Debug)]
pub struct MtuProbe {
    config: MtuConfig,
    confirmed: usize,
    ceiling: usize,
    step: usize,
    failures: u32,
    next_seq: u32,
    outstanding: Option<Outstanding>,
    last_probe_at: Option<Instant>,
    last_increase: Instant,

    /// 한 번이라도 수렴했는지 (`reset`만 되돌린다)
    complete: bool,

    /// 마지막 수렴 시각. 재탐색 중에는 None
    settled_at: Option<Instant>,
}

impl MtuProbe {
    pub fn new(config: MtuConfig, now: Instant) -> Self {
        let max_mtu = config.max_mtu.max(config.min_mtu);
        Self {
            confirmed: config.min_mtu,
            ceiling: max_mtu,
            step: config.initial_step.max(1),
            config,
            failures: 0,
            next_seq: 0,
            outstanding: None,
            last_probe_at: None,
            last_increase: now,
            complete: false,
            settled_at: None,
        }
    }

    /// 현재 확정 MTU
    pub fn confirmed_mtu(&self) -> usize {
        self.confirmed
    }

    pub fn is_discovery_complete(&self) -> bool {
        self.complete
    }

    /// 처음부터 다시 탐색
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(self.config.clone(), now);
    }

    /// 시간 진행: 보낼 프로브가 있으면 반환
    pub fn poll(&mut self, now: Instant) -> Option<ProbeRequest> {
        if let Some(settled_at) = self.settled_at {
            if self.confirmed >= self.config.max_mtu
                || now.saturating_duration_since(settled_at) < self.config.retry_larger_after
            {
                return None;
            }
            debug!("MTU 재탐색: confirmed={}", self.confirmed);
            self.settled_at = None;
            self.ceiling = self.config.max_mtu;
            self.step = self.config.initial_step.max(1);
            self.failures = 0;
            self.last_increase = now;
        }

        if let Some(probe) = self.outstanding {
            if now.saturating_duration_since(probe.sent_at) < self.config.probe_timeout {
                return None;
            }
            self.outstanding = None;
            self.failures += 1;
            trace!("MTU 프로브 {} ({} bytes) 타임아웃 #{}", probe.seq, probe.size, self.failures);

            if self.failures >= self.config.max_failures_per_size {
                self.ceiling = (probe.size - 1).max(self.confirmed);
                self.step = (self.step / 2).max(self.config.min_step).max(1);
                self.failures = 0;
                debug!("MTU 상한 하향: ceiling={}, step={}", self.ceiling, self.step);
            }
        }

        let gap = self.ceiling - self.confirmed;
        if gap == 0 || gap < self.config.min_step {
            if now.saturating_duration_since(self.last_increase) >= self.config.stability_window {
                debug!("MTU 탐색 완료: {}", self.confirmed);
                self.complete = true;
                self.settled_at = Some(now);
            }
            return None;
        }

        if let Some(last) = self.last_probe_at {
            if now.saturating_duration_since(last) < self.config.probe_interval {
                return None;
            }
        }

        let size = self.confirmed + self.step.min(gap);
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.outstanding = Some(Outstanding {
            seq,
            size,
            sent_at: now,
        });
        self.last_probe_at = Some(now);

        Some(ProbeRequest { seq, size })
    }

    /// 프로브 응답 수신
    pub fn on_ack(&mut self, seq: u32, now: Instant) {
        let Some(probe) = self.outstanding else {
            return;
        };
        if probe.seq != seq {
            return;
        }

        self.outstanding = None;
        self.failures = 0;
        if probe.size > self.confirmed {
            self.confirmed = probe.size;
            self.last_increase = now;
            trace!("MTU 확정: {}", self.confirmed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> MtuConfig {
        MtuConfig {
            min_mtu: 508,
            max_mtu: 1400,
            initial_step: 256,
            min_step: 16,
            probe_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(50),
            max_failures_per_size: 2,
            stability_window: Duration::from_millis(200),
            retry_larger_after: Duration::from_secs(5),
        }
    }

    /// 경로 MTU가 `path_mtu`인 링크에서 탐색이 끝날 때까지 진행
    fn run(probe: &mut MtuProbe, path_mtu: usize, start: Instant, limit: Duration) -> Instant {
        let mut now = start;
        while now - start < limit {
            if let Some(req) = probe.poll(now) {
                assert!(req.size >= config().min_mtu && req.size <= config().max_mtu);
                if req.size <= path_mtu {
                    probe.on_ack(req.seq, now + Duration::from_millis(2));
                }
            }
            if probe.settled_at.is_some() {
                break;
            }
            now += Duration::from_millis(5);
        }
        now
    }

    #[test]
    fn test_reaches_max_on_clean_path() {
        let start = Instant::now();
        let mut probe = MtuProbe::new(config(), start);
        run(&mut probe, 9000, start, Duration::from_secs(10));
        assert!(probe.is_discovery_complete());
        assert_eq!(probe.confirmed_mtu(), 1400);
    }

    #[test]
    fn test_converges_below_path_mtu() {
        let start = Instant::now();
        let mut probe = MtuProbe::new(config(), start);
        run(&mut probe, 1200, start, Duration::from_secs(30));
        assert!(probe.is_discovery_complete());
        let mtu = probe.confirmed_mtu();
        assert!(mtu <= 1200);
        assert!(1200 - mtu < config().min_step);
    }

    #[test]
    fn test_never_below_min() {
        let start = Instant::now();
        let mut probe = MtuProbe::new(config(), start);
        run(&mut probe, 100, start, Duration::from_secs(30));
        assert!(probe.is_discovery_complete());
        assert_eq!(probe.confirmed_mtu(), 508);
    }

    #[test]
    fn test_retry_larger_after_completion() {
        let start = Instant::now();
        let mut probe = MtuProbe::new(config(), start);
        let done = run(&mut probe, 1000, start, Duration::from_secs(30));
        let before = probe.confirmed_mtu();
        assert!(before <= 1000);

        // 아직 재탐색 시점 아님
        assert!(probe.poll(done + Duration::from_secs(1)).is_none());

        // 재탐색 중에도 완료 상태는 유지
        let later = done + config().retry_larger_after;
        let req = probe.poll(later).unwrap();
        assert!(req.size > before);
        assert!(probe.is_discovery_complete());

        // 경로가 넓어졌으면 더 큰 값으로 다시 수렴
        probe.on_ack(req.seq, later);
        run(&mut probe, 1300, later, Duration::from_secs(30));
        assert!(probe.is_discovery_complete());
        let after = probe.confirmed_mtu();
        assert!(after > before && after <= 1300);
        assert!(1300 - after < config().min_step);
    }

    #[test]
    fn test_complete_until_reset() {
        let start = Instant::now();
        let mut probe = MtuProbe::new(config(), start);
        let done = run(&mut probe, 1000, start, Duration::from_secs(30));
        assert!(probe.is_discovery_complete());

        // 재탐색 프로브가 모두 실패해도 완료 상태와 확정값은 그대로
        let mut now = done + config().retry_larger_after;
        for _ in 0..200 {
            let _ = probe.poll(now);
            assert!(probe.is_discovery_complete());
            now += Duration::from_millis(20);
        }
        assert!(probe.confirmed_mtu() <= 1000);

        probe.reset(now);
        assert!(!probe.is_discovery_complete());
        assert_eq!(probe.confirmed_mtu(), 508);
    }

    #[test]
    fn test_stale_ack_ignored() {
        let start = Instant::now();
        let mut probe = MtuProbe::new(config(), start);
        let req = probe.poll(start).unwrap();
        probe.on_ack(req.seq.wrapping_add(5), start);
        assert_eq!(probe.confirmed_mtu(), 508);
        probe.on_ack(req.seq, start);
        assert_eq!(probe.confirmed_mtu(), req.size);
    }
}
