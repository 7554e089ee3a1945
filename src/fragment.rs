//! UDP 조각화와 재조립
//!
//! - Fragment: 경로 MTU 안에 들어가는 조각 (헤더 + 페이로드)
//! - AssemblyBuffer: 수신측에서 하나의 packet_id를 조립 중인 버퍼
//! - DefragBoard: (송신자, packet_id)별 조립 버퍼 관리
//!
//! 조각 헤더 레이아웃 (little endian, 19 bytes):
//!
//! ```text
//! magic(1) | packet_id(4) | fragment_id(2) | total_len(4) | offset(4) | crc32(4) | payload
//! ```

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::config::FragmentConfig;
use crate::member::MemberId;
use crate::{Error, Result, FRAGMENT_MAGIC};

/// 조각 헤더 크기
pub const FRAGMENT_HEADER_LEN: usize = 19;

/// 조각 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// 논리 메시지 식별자 (송신자별)
    pub packet_id: u32,

    /// 메시지 내 조각 순번 (0부터)
    pub fragment_id: u16,

    /// 원본 메시지 전체 길이
    pub total_len: u32,

    /// 이 조각의 메시지 내 오프셋
    pub offset: u32,

    /// 페이로드 CRC32
    pub crc32: u32,
}

/// 조각 (송신 데이터그램 단위)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub payload: Bytes,
}

impl Fragment {
    /// 새 조각 생성
    pub fn new(packet_id: u32, fragment_id: u16, total_len: u32, offset: u32, payload: Bytes) -> Self {
        Self {
            header: FragmentHeader {
                packet_id,
                fragment_id,
                total_len,
                offset,
                crc32: crc32fast::hash(&payload),
            },
            payload,
        }
    }

    /// 데이터그램 바이트로 직렬화
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_LEN + self.payload.len());
        buf.put_u8(FRAGMENT_MAGIC);
        buf.put_u32_le(self.header.packet_id);
        buf.put_u16_le(self.header.fragment_id);
        buf.put_u32_le(self.header.total_len);
        buf.put_u32_le(self.header.offset);
        buf.put_u32_le(self.header.crc32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// 데이터그램 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return Err(Error::TruncatedDatagram { len: bytes.len() });
        }

        let mut cursor = bytes;
        let magic = cursor.get_u8();
        if magic != FRAGMENT_MAGIC {
            return Err(Error::InvalidMagicNumber {
                expected: FRAGMENT_MAGIC as u32,
                got: magic as u32,
            });
        }

        let header = FragmentHeader {
            packet_id: cursor.get_u32_le(),
            fragment_id: cursor.get_u16_le(),
            total_len: cursor.get_u32_le(),
            offset: cursor.get_u32_le(),
            crc32: cursor.get_u32_le(),
        };

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(cursor),
        })
    }

    /// CRC 검증
    pub fn verify_crc(&self) -> bool {
        crc32fast::hash(&self.payload) == self.header.crc32
    }
}

/// 메시지를 조각들로 나누는 반복자
///
/// 입력에 대한 순수 함수라 `clone()`으로 처음부터 다시 돌릴 수 있다.
#[derive(Debug, Clone)]
pub struct Fragments {
    packet_id: u32,
    payload: Bytes,
    chunk_len: usize,
    next_index: usize,
    count: usize,
}

impl Fragments {
    /// 전체 조각 수
    pub fn fragment_count(&self) -> usize {
        self.count
    }
}

impl Iterator for Fragments {
    type Item = Fragment;

    fn next(&mut self) -> Option<Fragment> {
        if self.next_index >= self.count {
            return None;
        }

        let index = self.next_index;
        self.next_index += 1;

        let start = index * self.chunk_len;
        let end = (start + self.chunk_len).min(self.payload.len());

        Some(Fragment::new(
            self.packet_id,
            index as u16,
            self.payload.len() as u32,
            start as u32,
            self.payload.slice(start..end),
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.next_index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Fragments {}

/// 페이로드를 `mtu` 크기 데이터그램에 맞는 조각들로 나눈다
///
/// 빈 페이로드도 조각 하나로 전송된다.
pub fn fragment(packet_id: u32, payload: Bytes, mtu: usize) -> Result<Fragments> {
    let chunk_len = crate::Config::fragment_payload_len(mtu);
    if chunk_len == 0 {
        return Err(Error::MtuTooSmall { mtu });
    }
    if payload.len() > u32::MAX as usize {
        return Err(Error::MessageTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        });
    }

    let count = payload.len().div_ceil(chunk_len).max(1);
    if count > u16::MAX as usize + 1 {
        return Err(Error::MessageTooLarge {
            len: payload.len(),
            max: (u16::MAX as usize + 1) * chunk_len,
        });
    }

    Ok(Fragments {
        packet_id,
        payload,
        chunk_len,
        next_index: 0,
        count,
    })
}

/// 송신측 조각 생성기
///
/// packet_id는 송신자 단위로 단조 증가한다.
#[derive(Debug, Default)]
pub struct Fragmenter {
    next_packet_id: AtomicU32,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 다음 packet_id 발급
    pub fn next_packet_id(&self) -> u32 {
        self.next_packet_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 페이로드를 조각내어 전송할 데이터그램 목록으로 변환
    pub fn split(&self, payload: Bytes, mtu: usize) -> Result<Vec<Bytes>> {
        let fragments = fragment(self.next_packet_id(), payload, mtu)?;
        Ok(fragments.map(|f| f.to_bytes()).collect())
    }
}

/// 조립 버퍼의 송신자 키
///
/// 홀펀칭 초기에는 릴레이가 아직 멤버를 식별하지 못하므로 원시 주소로 구분한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderKey {
    Member(MemberId),
    Endpoint(SocketAddr),
}

/// 조각 하나를 넣은 결과
#[derive(Debug)]
pub enum PushResult {
    /// 아직 조립 중
    Assembling,

    /// 마지막 조각 도착, 조립 완료
    Complete(Bytes),

    /// 잘못된 조각 (폐기됨)
    Error(Error),
}

/// 수신측 조립 버퍼
#[derive(Debug)]
pub struct AssemblyBuffer {
    /// 원본 메시지 길이
    total_len: u32,

    /// 조립 데이터
    data: BytesMut,

    /// 수신된 구간 (offset -> len)
    ranges: BTreeMap<u32, u32>,

    /// 수신된 조각 번호
    fragment_ids: HashMap<u16, u32>,

    /// 수신 바이트 수
    received_bytes: u32,

    /// 첫 조각 수신 시간
    pub created_at: Instant,
}

impl AssemblyBuffer {
    /// 새 조립 버퍼 생성
    pub fn new(total_len: u32, now: Instant) -> Self {
        let mut data = BytesMut::with_capacity(total_len as usize);
        data.resize(total_len as usize, 0);

        Self {
            total_len,
            data,
            ranges: BTreeMap::new(),
            fragment_ids: HashMap::new(),
            received_bytes: 0,
            created_at: now,
        }
    }

    /// 조각 삽입
    ///
    /// 이미 받은 조각이면 `Ok(false)`, 새로 들어가면 `Ok(true)`.
    fn insert(&mut self, fragment: &Fragment) -> Result<bool> {
        let header = &fragment.header;
        let len = fragment.payload.len() as u32;
        let invalid = Error::InvalidFragment {
            packet_id: header.packet_id,
            fragment_id: header.fragment_id,
        };

        if let Some(&offset) = self.fragment_ids.get(&header.fragment_id) {
            // 같은 조각 재수신은 무시, 같은 번호에 다른 위치면 비정상
            return if offset == header.offset { Ok(false) } else { Err(invalid) };
        }

        let end = header.offset.checked_add(len).ok_or(Error::InvalidFragment {
            packet_id: header.packet_id,
            fragment_id: header.fragment_id,
        })?;
        if end > self.total_len || (len == 0 && self.total_len != 0) {
            return Err(invalid);
        }

        // 겹치는 구간 검사
        if let Some((&start, &prev_len)) = self.ranges.range(..=header.offset).next_back() {
            if start + prev_len > header.offset {
                return Err(invalid);
            }
        }
        if let Some((&start, _)) = self.ranges.range(header.offset..).next() {
            if start < end {
                return Err(invalid);
            }
        }

        self.data[header.offset as usize..end as usize].copy_from_slice(&fragment.payload);
        self.ranges.insert(header.offset, len);
        self.fragment_ids.insert(header.fragment_id, header.offset);
        self.received_bytes += len;
        Ok(true)
    }

    /// 완료 여부 확인
    pub fn is_complete(&self) -> bool {
        self.received_bytes == self.total_len && !self.fragment_ids.is_empty()
    }

    /// 수신률 계산
    pub fn receive_ratio(&self) -> f64 {
        if self.total_len == 0 {
            return if self.fragment_ids.is_empty() { 0.0 } else { 1.0 };
        }
        self.received_bytes as f64 / self.total_len as f64
    }

    /// 완료된 데이터 추출
    pub fn into_data(self) -> Bytes {
        self.data.freeze()
    }
}

/// (송신자, packet_id)별 조립 버퍼 보드
#[derive(Debug)]
pub struct DefragBoard {
    config: FragmentConfig,
    assemblies: HashMap<(SenderKey, u32), AssemblyBuffer>,
    /// 최근 완료된 packet_id (중복 조각이 두 번 완료되지 않도록)
    completed: HashMap<(SenderKey, u32), Instant>,
    last_prune: Option<Instant>,
}

impl DefragBoard {
    pub fn new(config: FragmentConfig) -> Self {
        Self {
            config,
            assemblies: HashMap::new(),
            completed: HashMap::new(),
            last_prune: None,
        }
    }

    /// 조각 하나 누적
    ///
    /// `Complete`는 packet_id당 정확히 한 번 나오고 버퍼는 즉시 제거된다.
    pub fn push_fragment(&mut self, fragment: Fragment, key: SenderKey, now: Instant) -> PushResult {
        let header = fragment.header;

        if !fragment.verify_crc() {
            return PushResult::Error(Error::CrcMismatch {
                expected: header.crc32,
                got: crc32fast::hash(&fragment.payload),
            });
        }

        if header.total_len as usize > self.config.max_message_len {
            self.assemblies.remove(&(key, header.packet_id));
            return PushResult::Error(Error::MessageTooLarge {
                len: header.total_len as usize,
                max: self.config.max_message_len,
            });
        }

        let map_key = (key, header.packet_id);
        if self.completed.contains_key(&map_key) {
            trace!("이미 완료된 packet {} 조각 무시", header.packet_id);
            return PushResult::Assembling;
        }

        // 단일 조각 메시지는 버퍼 없이 바로 완료
        if !self.assemblies.contains_key(&map_key)
            && header.offset == 0
            && fragment.payload.len() as u32 == header.total_len
        {
            self.completed.insert(map_key, now);
            return PushResult::Complete(fragment.payload);
        }

        let buffer = self
            .assemblies
            .entry(map_key)
            .or_insert_with(|| AssemblyBuffer::new(header.total_len, now));

        if buffer.total_len != header.total_len {
            return PushResult::Error(Error::FragmentLengthMismatch {
                packet_id: header.packet_id,
                expected: buffer.total_len,
                got: header.total_len,
            });
        }

        match buffer.insert(&fragment) {
            Ok(_) => {}
            Err(e) => return PushResult::Error(e),
        }

        if buffer.is_complete() {
            if let Some(buffer) = self.assemblies.remove(&map_key) {
                self.completed.insert(map_key, now);
                trace!(
                    "packet {} 조립 완료: {} bytes, {:?}",
                    header.packet_id,
                    header.total_len,
                    key
                );
                return PushResult::Complete(buffer.into_data());
            }
        }

        PushResult::Assembling
    }

    /// 원시 데이터그램을 파싱해 누적
    pub fn push_datagram(&mut self, datagram: &[u8], key: SenderKey, now: Instant) -> PushResult {
        match Fragment::from_bytes(datagram) {
            Ok(fragment) => self.push_fragment(fragment, key, now),
            Err(e) => PushResult::Error(e),
        }
    }

    /// 완성 여부와 관계없이 오래된 조립 버퍼 폐기
    pub fn prune_stale(&mut self, now: Instant) -> usize {
        let stale_after = self.config.stale_after;
        let before = self.assemblies.len();

        self.assemblies.retain(|(key, packet_id), buffer| {
            let keep = now.saturating_duration_since(buffer.created_at) < stale_after;
            if !keep {
                debug!(
                    "조립 버퍼 폐기: packet {} from {:?}, {:.1}% 수신",
                    packet_id,
                    key,
                    buffer.receive_ratio() * 100.0
                );
            }
            keep
        });
        self.completed
            .retain(|_, at| now.saturating_duration_since(*at) < stale_after);
        self.last_prune = Some(now);

        before - self.assemblies.len()
    }

    /// 정리 주기가 지났을 때만 정리
    pub fn maybe_prune(&mut self, now: Instant) -> usize {
        let due = match self.last_prune {
            Some(last) => now.saturating_duration_since(last) >= self.config.prune_interval,
            None => true,
        };
        if due {
            self.prune_stale(now)
        } else {
            0
        }
    }

    /// 특정 송신자의 조립 버퍼 제거 (링크 종료 시)
    pub fn forget_sender(&mut self, key: SenderKey) {
        self.assemblies.retain(|(k, _), _| *k != key);
        self.completed.retain(|(k, _), _| *k != key);
    }

    /// 조립 중인 버퍼 수
    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }

    /// 정리 기준 시간
    pub fn stale_after(&self) -> Duration {
        self.config.stale_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> DefragBoard {
        DefragBoard::new(FragmentConfig::default())
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<u8>>())
    }

    fn reassemble(fragments: impl Iterator<Item = Fragment>, now: Instant) -> Option<Bytes> {
        let mut board = board();
        let key = SenderKey::Member(MemberId(7));
        let mut result = None;
        for fragment in fragments {
            match board.push_fragment(fragment, key, now) {
                PushResult::Complete(data) => {
                    assert!(result.is_none(), "Complete fired twice");
                    result = Some(data);
                }
                PushResult::Assembling => {}
                PushResult::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(board.pending(), 0);
        result
    }

    #[test]
    fn test_fragment_serialization() {
        let fragment = Fragment::new(3, 1, 5000, 1181, Bytes::from_static(b"hello"));
        let bytes = fragment.to_bytes();
        assert_eq!(bytes.len(), FRAGMENT_HEADER_LEN + 5);

        let restored = Fragment::from_bytes(&bytes).unwrap();
        assert_eq!(restored, fragment);
        assert!(restored.verify_crc());
    }

    #[test]
    fn test_round_trip_all_sizes() {
        let mtu = 64;
        let chunk = mtu - FRAGMENT_HEADER_LEN;
        let now = Instant::now();

        for len in 0..=(3 * chunk + 7) {
            let data = payload(len);
            let fragments = fragment(len as u32, data.clone(), mtu).unwrap();
            for f in fragments.clone() {
                assert!(f.to_bytes().len() <= mtu);
            }
            let restored = reassemble(fragments, now).unwrap();
            assert_eq!(restored, data, "size {len}");
        }
    }

    #[test]
    fn test_out_of_order_and_duplicates() {
        let data = payload(3 * 1381 + 500);
        let mut fragments: Vec<Fragment> = fragment(9, data.clone(), 1400).unwrap().collect();
        assert_eq!(fragments.len(), 4);
        fragments.reverse();
        let dup = fragments[1].clone();
        fragments.insert(2, dup);

        let restored = reassemble(fragments.into_iter(), Instant::now()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_fragments_restartable() {
        let fragments = fragment(1, payload(1000), 200).unwrap();
        let first: Vec<_> = fragments.clone().collect();
        let second: Vec<_> = fragments.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_length_mismatch_is_error() {
        let mut board = board();
        let key = SenderKey::Endpoint("10.0.0.1:4000".parse().unwrap());
        let now = Instant::now();

        let first = Fragment::new(5, 0, 200, 0, payload(100));
        assert!(matches!(board.push_fragment(first, key, now), PushResult::Assembling));

        let liar = Fragment::new(5, 1, 300, 100, payload(100));
        assert!(matches!(
            board.push_fragment(liar, key, now),
            PushResult::Error(Error::FragmentLengthMismatch { expected: 200, got: 300, .. })
        ));
        assert_eq!(board.pending(), 1);
    }

    #[test]
    fn test_complete_fires_once_per_packet() {
        let mut board = board();
        let key = SenderKey::Member(MemberId(2));
        let now = Instant::now();
        let single = Fragment::new(11, 0, 4, 0, Bytes::from_static(b"ping"));

        assert!(matches!(board.push_fragment(single.clone(), key, now), PushResult::Complete(_)));
        assert!(matches!(board.push_fragment(single, key, now), PushResult::Assembling));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut board = DefragBoard::new(FragmentConfig {
            max_message_len: 1000,
            ..FragmentConfig::default()
        });
        let key = SenderKey::Member(MemberId(1));
        let fragment = Fragment::new(1, 0, 5000, 0, payload(100));
        assert!(matches!(
            board.push_fragment(fragment, key, Instant::now()),
            PushResult::Error(Error::MessageTooLarge { .. })
        ));
        assert_eq!(board.pending(), 0);
    }

    #[test]
    fn test_overlapping_fragment_rejected() {
        let mut board = board();
        let key = SenderKey::Member(MemberId(1));
        let now = Instant::now();
        board.push_fragment(Fragment::new(1, 0, 300, 0, payload(100)), key, now);
        let overlap = Fragment::new(1, 1, 300, 50, payload(100));
        assert!(matches!(
            board.push_fragment(overlap, key, now),
            PushResult::Error(Error::InvalidFragment { .. })
        ));
    }

    #[test]
    fn test_corrupted_fragment_rejected() {
        let mut fragment = Fragment::new(1, 0, 300, 0, payload(100));
        fragment.payload = payload(99).slice(..);
        assert!(matches!(
            board().push_fragment(fragment, SenderKey::Member(MemberId(1)), Instant::now()),
            PushResult::Error(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_senders_do_not_collide() {
        let mut board = board();
        let now = Instant::now();
        let a = SenderKey::Member(MemberId(1));
        let b = SenderKey::Endpoint("192.0.2.1:9000".parse().unwrap());

        let data_a = payload(300);
        let data_b = payload(250);
        let mut fa = fragment(42, data_a.clone(), 150).unwrap();
        let mut fb = fragment(42, data_b.clone(), 150).unwrap();

        assert!(matches!(board.push_fragment(fa.next().unwrap(), a, now), PushResult::Assembling));
        assert!(matches!(board.push_fragment(fb.next().unwrap(), b, now), PushResult::Assembling));
        assert_eq!(board.pending(), 2);

        let mut done_a = None;
        for f in fa {
            if let PushResult::Complete(d) = board.push_fragment(f, a, now) {
                done_a = Some(d);
            }
        }
        let mut done_b = None;
        for f in fb {
            if let PushResult::Complete(d) = board.push_fragment(f, b, now) {
                done_b = Some(d);
            }
        }
        assert_eq!(done_a.unwrap(), data_a);
        assert_eq!(done_b.unwrap(), data_b);
    }

    #[test]
    fn test_prune_stale() {
        let mut board = board();
        let key = SenderKey::Member(MemberId(1));
        let start = Instant::now();

        board.push_fragment(Fragment::new(1, 0, 300, 0, payload(100)), key, start);
        assert_eq!(board.prune_stale(start + Duration::from_secs(1)), 0);
        assert_eq!(board.prune_stale(start + board.stale_after()), 1);
        assert_eq!(board.pending(), 0);

        // packet_id 재사용 시 폐기된 버퍼가 되살아나지 않음
        let fresh = Fragment::new(1, 0, 100, 0, payload(100));
        assert!(matches!(
            board.push_fragment(fresh, key, start + Duration::from_secs(6)),
            PushResult::Complete(_)
        ));
    }

    #[test]
    fn test_mtu_too_small() {
        assert!(matches!(
            fragment(1, payload(10), FRAGMENT_HEADER_LEN),
            Err(Error::MtuTooSmall { .. })
        ));
    }
}
