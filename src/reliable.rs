//! 손실 UDP 위의 신뢰 채널 (ARQ)
//!
//! - 송신: 애플리케이션 메시지 하나가 Data 프레임 하나
//! - 수신: 순서 복원 후 바이트 스트림([`RecvStream`])으로 전달
//! - 프레임 번호는 협상된 값에서 시작해 u32 범위에서 순환
//! - ACK는 개별 번호와 함께 수신측의 누적 전달 지점을 싣는다. 송신측은
//!   누적 지점을 넘은 프레임만 버리므로 갭 뒤에서 버퍼링된 프레임도
//!   [`ReliableChannel::take_unacked`]로 다시 꺼낼 수 있다
//!
//! 통과 모드(`passthrough`)는 이미 신뢰성 있는 전송(릴레이 TCP) 위에서 쓰며
//! ACK와 재전송 없이 프레임을 그대로 내보낸다.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::ReliableConfig;

/// 프레임 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    Data,
    Ack,
}

/// ARQ 프레임
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliableFrame {
    pub frame_number: u32,
    pub frame_type: FrameType,

    /// ACK 전용: 이 번호 이전은 모두 수신 스트림에 전달됨
    pub ack_through: u32,

    pub payload: Bytes,
}

impl ReliableFrame {
    pub fn data(frame_number: u32, payload: Bytes) -> Self {
        Self {
            frame_number,
            frame_type: FrameType::Data,
            ack_through: 0,
            payload,
        }
    }

    pub fn ack(frame_number: u32, ack_through: u32) -> Self {
        Self {
            frame_number,
            frame_type: FrameType::Ack,
            ack_through,
            payload: Bytes::new(),
        }
    }
}

/// 순환 번호 거리 (a - b)
#[inline]
fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// 메시지 앞에 u32 길이를 붙인다
pub fn frame_message(message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + message.len());
    buf.put_u32_le(message.len() as u32);
    buf.extend_from_slice(message);
    buf.freeze()
}

/// 순서가 복원된 수신 바이트 스트림
#[derive(Debug, Default)]
pub struct RecvStream {
    buf: BytesMut,
}

impl RecvStream {
    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 아직 꺼내지 않은 전체 바이트
    pub fn peek_all(&self) -> &[u8] {
        &self.buf
    }

    /// 앞에서 최대 `n` 바이트 꺼내기
    pub fn pop_front(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// 길이 접두 메시지 하나가 온전히 있으면 꺼낸다
    pub fn try_pop_message(&mut self) -> Option<Bytes> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = (&self.buf[..4]).get_u32_le() as usize;
        if self.buf.len() < 4 + len {
            return None;
        }
        self.buf.advance(4);
        Some(self.buf.split_to(len).freeze())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// ACK 대기 중인 프레임
#[derive(Debug)]
struct InFlight {
    frame: ReliableFrame,
    first_sent: Instant,
    last_sent: Instant,
    transmissions: u32,

    /// 개별 ACK 수신 (아직 누적 지점 밖일 수 있음)
    acked: bool,
}

/// `tick` 결과
#[derive(Debug, Default)]
pub struct TickOutput {
    /// 지금 보내야 할 프레임 (ACK, 재전송, 신규)
    pub frames: Vec<ReliableFrame>,

    /// 이번 틱에 채널이 실패했는지 (인스턴스당 한 번만 true)
    pub failed: bool,
}

/// 신뢰 채널
#[derive(Debug)]
pub struct ReliableChannel {
    config: ReliableConfig,

    /// 다음에 부여할 송신 번호
    next_send: u32,

    /// 아직 한 번도 보내지 않은 프레임
    send_queue: VecDeque<ReliableFrame>,

    /// 누적 ACK 대기 (번호 순)
    in_flight: VecDeque<InFlight>,

    /// 다음에 기대하는 수신 번호
    next_expected: u32,

    /// 순서를 앞질러 도착한 프레임
    recv_buffer: HashMap<u32, Bytes>,

    /// 보내야 할 ACK
    pending_acks: Vec<u32>,

    stream: RecvStream,

    /// 평활 RTT
    srtt: Option<Duration>,

    failed: bool,
    failure_reported: bool,
}

impl ReliableChannel {
    pub fn new(config: ReliableConfig, first_send_frame: u32, first_recv_frame: u32) -> Self {
        Self {
            config,
            next_send: first_send_frame,
            send_queue: VecDeque::new(),
            in_flight: VecDeque::new(),
            next_expected: first_recv_frame,
            recv_buffer: HashMap::new(),
            pending_acks: Vec::new(),
            stream: RecvStream::default(),
            srtt: None,
            failed: false,
            failure_reported: false,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.config.passthrough
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// 데이터 프레임 하나 큐잉
    pub fn send(&mut self, payload: Bytes) {
        let frame = ReliableFrame::data(self.next_send, payload);
        self.next_send = self.next_send.wrapping_add(1);
        self.send_queue.push_back(frame);
    }

    /// 외부 RTT 측정값 반영 (ping 등)
    pub fn set_rtt(&mut self, rtt: Duration) {
        self.srtt = Some(rtt);
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// n번째 전송의 재전송 타임아웃
    fn rto(&self, transmissions: u32) -> Duration {
        let rtt = self.srtt.unwrap_or(self.config.default_rtt);
        let base = (rtt * 2).clamp(self.config.min_rto, self.config.max_rto);
        let shift = transmissions.saturating_sub(1).min(16);
        base.saturating_mul(1 << shift).min(self.config.max_rto)
    }

    /// 시간 진행: 보낼 프레임 수집
    pub fn tick(&mut self, now: Instant) -> TickOutput {
        let mut out = TickOutput::default();

        if self.failed {
            if !self.failure_reported {
                self.failure_reported = true;
                out.failed = true;
            }
            return out;
        }

        let through = self.next_expected;
        out.frames.extend(
            self.pending_acks
                .drain(..)
                .map(|number| ReliableFrame::ack(number, through)),
        );

        if self.config.passthrough {
            out.frames.extend(self.send_queue.drain(..));
            return out;
        }

        // 재전송
        for index in 0..self.in_flight.len() {
            let rto = self.rto(self.in_flight[index].transmissions);
            let entry = &mut self.in_flight[index];
            if entry.acked || now < entry.last_sent + rto {
                continue;
            }
            if entry.transmissions > self.config.max_retransmits {
                warn!(
                    "프레임 {} 재전송 한도 초과 ({}회), 채널 실패",
                    entry.frame.frame_number,
                    entry.transmissions - 1
                );
                self.failed = true;
                self.failure_reported = true;
                return TickOutput {
                    frames: Vec::new(),
                    failed: true,
                };
            }
            trace!(
                "프레임 {} 재전송 #{} (rto {:?})",
                entry.frame.frame_number,
                entry.transmissions,
                rto
            );
            entry.transmissions += 1;
            entry.last_sent = now;
            out.frames.push(entry.frame.clone());
        }

        // 신규
        while self.in_flight.len() < self.config.send_window {
            let Some(frame) = self.send_queue.pop_front() else {
                break;
            };
            out.frames.push(frame.clone());
            self.in_flight.push_back(InFlight {
                frame,
                first_sent: now,
                last_sent: now,
                transmissions: 1,
                acked: false,
            });
        }

        out
    }

    /// 프레임 수신
    pub fn on_frame_received(&mut self, frame: ReliableFrame, now: Instant) {
        if self.failed {
            return;
        }

        match frame.frame_type {
            FrameType::Ack => self.handle_ack(frame.frame_number, frame.ack_through, now),
            FrameType::Data => self.handle_data(frame),
        }
    }

    fn handle_ack(&mut self, frame_number: u32, ack_through: u32, now: Instant) {
        if self.config.passthrough {
            return;
        }

        if let Some(entry) = self
            .in_flight
            .iter_mut()
            .find(|e| e.frame.frame_number == frame_number)
        {
            // 재전송된 프레임은 어느 전송에 대한 ACK인지 모르므로 제외
            if !entry.acked && entry.transmissions == 1 {
                let sample = now.saturating_duration_since(entry.first_sent);
                self.srtt = Some(match self.srtt {
                    Some(prev) => (prev * 7 + sample) / 8,
                    None => sample,
                });
            }
            entry.acked = true;
        }

        while let Some(front) = self.in_flight.front() {
            if seq_diff(front.frame.frame_number, ack_through) >= 0 {
                break;
            }
            self.in_flight.pop_front();
        }
    }

    fn handle_data(&mut self, frame: ReliableFrame) {
        let number = frame.frame_number;
        if !self.config.passthrough {
            self.pending_acks.push(number);
        }

        let diff = seq_diff(number, self.next_expected);
        if diff < 0 {
            trace!("중복 프레임 {} 무시", number);
            return;
        }
        if diff as u32 >= self.config.recv_window {
            debug!(
                "수신 윈도우 밖 프레임 {} (expected {})",
                number, self.next_expected
            );
            // 받지 않은 프레임은 ACK하지 않는다
            self.pending_acks.pop();
            return;
        }

        if diff > 0 {
            self.recv_buffer.entry(number).or_insert(frame.payload);
            return;
        }

        self.stream.push(&frame.payload);
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(payload) = self.recv_buffer.remove(&self.next_expected) {
            self.stream.push(&payload);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
    }

    /// 수신 스트림
    pub fn stream(&mut self) -> &mut RecvStream {
        &mut self.stream
    }

    /// 수신측 전달이 확인되지 않은 페이로드를 순서대로 모두 꺼낸다.
    /// 갭 뒤에서 개별 ACK만 받은 프레임도 포함
    pub fn take_unacked(&mut self) -> Vec<Bytes> {
        self.in_flight
            .drain(..)
            .map(|e| e.frame.payload)
            .chain(self.send_queue.drain(..).map(|f| f.payload))
            .collect()
    }

    /// 누적 ACK 대기 + 미전송 프레임 수
    pub fn outstanding(&self) -> usize {
        self.in_flight.len() + self.send_queue.len()
    }

    /// 새 번호로 재시작
    pub fn reset(&mut self, first_send_frame: u32, first_recv_frame: u32) {
        self.next_send = first_send_frame;
        self.next_expected = first_recv_frame;
        self.send_queue.clear();
        self.in_flight.clear();
        self.recv_buffer.clear();
        self.pending_acks.clear();
        self.stream = RecvStream::default();
        self.failed = false;
        self.failure_reported = false;
    }
}
