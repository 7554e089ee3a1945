//! UDP 소켓 풀
//!
//! - UdpSocketPool: 릴레이측 UDP 소켓 주소 목록, 멤버마다 무작위 배정
//! - PortRecycleRegistry: 클라이언트측, 그룹 이탈 시 소켓을 보관했다가
//!   다음 소켓 생성 요청에서 같은 로컬 포트로 재사용

use std::collections::VecDeque;
use std::net::SocketAddr;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

/// 릴레이 UDP 소켓 풀
#[derive(Debug, Clone)]
pub struct UdpSocketPool {
    sockets: Vec<SocketAddr>,
}

impl UdpSocketPool {
    pub fn new(sockets: Vec<SocketAddr>) -> Self {
        Self { sockets }
    }

    /// 무작위 소켓 하나
    pub fn pick(&self, rng: &mut impl Rng) -> Option<SocketAddr> {
        self.sockets.choose(rng).copied()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.sockets.contains(addr)
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.sockets
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

/// 보관 중인 소켓 레지스트리 (가장 최근에 보관한 것부터 꺼냄)
#[derive(Debug)]
pub struct PortRecycleRegistry<S> {
    capacity: usize,
    parked: Mutex<VecDeque<(u16, S)>>,
}

impl<S> PortRecycleRegistry<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            parked: Mutex::new(VecDeque::new()),
        }
    }

    /// 소켓 보관. 같은 포트는 교체, 용량 초과 시 가장 오래된 것을 돌려준다
    pub fn park(&self, port: u16, socket: S) -> Option<(u16, S)> {
        let mut parked = self.parked.lock();
        parked.retain(|(p, _)| *p != port);
        parked.push_back((port, socket));

        if parked.len() > self.capacity {
            let evicted = parked.pop_front();
            if let Some((port, _)) = &evicted {
                debug!("재활용 소켓 방출: port {}", port);
            }
            return evicted;
        }
        None
    }

    /// 가장 최근에 보관한 소켓 꺼내기 (소비)
    pub fn take_latest(&self) -> Option<(u16, S)> {
        self.parked.lock().pop_back()
    }

    /// 특정 포트의 소켓 꺼내기
    pub fn take(&self, port: u16) -> Option<S> {
        let mut parked = self.parked.lock();
        let pos = parked.iter().position(|(p, _)| *p == port)?;
        parked.remove(pos).map(|(_, socket)| socket)
    }

    pub fn len(&self) -> usize {
        self.parked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_pick_from_pool() {
        let addrs: Vec<SocketAddr> = (0..4)
            .map(|i| format!("198.51.100.1:{}", 7000 + i).parse().unwrap())
            .collect();
        let pool = UdpSocketPool::new(addrs.clone());
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..32 {
            let addr = pool.pick(&mut rng).unwrap();
            assert!(pool.contains(&addr));
        }
        assert!(UdpSocketPool::new(Vec::new()).pick(&mut rng).is_none());
    }

    #[test]
    fn test_registry_take_consumes() {
        let registry = PortRecycleRegistry::new(4);
        registry.park(40001, "a");
        registry.park(40002, "b");

        assert_eq!(registry.take_latest(), Some((40002, "b")));
        assert_eq!(registry.take(40001), Some("a"));
        assert!(registry.take(40001).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_bounded() {
        let registry = PortRecycleRegistry::new(2);
        assert!(registry.park(1, ()).is_none());
        assert!(registry.park(2, ()).is_none());
        assert_eq!(registry.park(3, ()), Some((1, ())));
        assert_eq!(registry.len(), 2);

        // 같은 포트 재보관은 교체
        assert!(registry.park(3, ()).is_none());
        assert_eq!(registry.len(), 2);
    }
}
