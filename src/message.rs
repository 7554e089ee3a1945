//! 프로토콜 메시지 정의
//!
//! - TCP 멤버 → 릴레이: [`ClientMessage`]
//! - TCP 릴레이 → 멤버: [`ServerMessage`]
//! - UDP: [`Datagram`] (항상 조각 헤더에 실려 전송)
//!
//! 모두 닫힌 enum이며 수신측은 빠짐없이 match한다.

use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::group::GroupId;
use crate::member::MemberId;
use crate::reliable::ReliableFrame;
use crate::Result;

/// 직접 링크 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// ping 응답 없음
    UdpTimeout,

    /// 신뢰 채널 재전송 한도 초과
    ReliableChannelFailed,

    /// 애플리케이션 요청
    Requested,
}

/// 릴레이 경유 피어 페이로드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayPayload {
    /// 통과 모드 신뢰 채널 프레임
    Reliable(ReliableFrame),

    /// 비신뢰 메시지
    Unreliable(Bytes),
}

/// 멤버 → 릴레이 (TCP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    JoinGroup {
        group: GroupId,
    },
    LeaveGroup,
    P2PMemberJoinAck {
        peer: MemberId,
    },
    CreateUdpSocketAck {
        tag: u64,
        local_addr: SocketAddr,
    },
    NotifyHolepunchSuccess {
        tag: u64,
        local: SocketAddr,
        external: SocketAddr,
    },
    PeerUdpNotifyHolepunchSuccess {
        peer: MemberId,
        tag: u64,
    },
    NotifyP2PHolepunchSuccess {
        peer: MemberId,
        tag: u64,
        send_addr: SocketAddr,
        recv_addr: SocketAddr,
    },
    NotifyJitDirectP2PTriggered {
        peer: MemberId,
    },
    P2PNotifyDirectP2PDisconnected {
        peer: MemberId,
        reason: DisconnectReason,
    },
    RelayToPeer {
        to: MemberId,
        payload: RelayPayload,
    },
}

/// 직접 링크 성립 시 전달되는 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectLinkInfo {
    /// 상대에게 보낼 주소
    pub send_addr: SocketAddr,

    /// 상대가 본 내 주소
    pub recv_addr: SocketAddr,

    /// 내 신뢰 채널 첫 송신 번호
    pub first_send_frame: u32,

    /// 내 신뢰 채널 첫 수신 번호
    pub first_recv_frame: u32,
}

/// 릴레이 → 멤버 (TCP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome {
        member: MemberId,
    },
    JoinGroupAck {
        group: GroupId,
        members: Vec<MemberId>,
    },
    P2PMemberJoin {
        peer: MemberId,
    },
    P2PMemberLeave {
        peer: MemberId,
    },
    RequestCreateUdpSocket {
        relay_udp: SocketAddr,
        tag: u64,
    },
    NewDirectP2PConnection {
        peer: MemberId,
        tag: u64,
    },
    RequestJitDirectP2PTrigger {
        peer: MemberId,
    },
    RequestP2PHolepunch {
        peer: MemberId,
        tag: u64,
        peer_local: SocketAddr,
        peer_external: SocketAddr,
    },
    NotifyDirectP2PEstablish {
        peer: MemberId,
        link: DirectLinkInfo,
    },
    P2PRecycleComplete {
        peer: MemberId,
        recycled: bool,
        link: DirectLinkInfo,
    },
    P2PNotifyDirectP2PDisconnected2 {
        peer: MemberId,
        reason: DisconnectReason,
    },
    RenewP2PConnectionState {
        peer: MemberId,
        retry_count: u32,
    },
    NotifyP2PRelayOnly {
        peer: MemberId,
    },
    RelayedFromPeer {
        from: MemberId,
        payload: RelayPayload,
    },
}

/// UDP 데이터그램 본문
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datagram {
    /// 멤버 → 릴레이 UDP 소켓
    ServerHolepunch {
        member: MemberId,
        tag: u64,
    },
    /// 릴레이 → 멤버, 관측된 외부 주소 포함
    ServerHolepunchAck {
        tag: u64,
        observed: SocketAddr,
    },
    /// 멤버 → 릴레이, 피어 핸드쉐이크 라운드의 주소 갱신
    PeerUdpServerHolepunch {
        member: MemberId,
        peer: MemberId,
        tag: u64,
        local: SocketAddr,
    },
    PeerUdpServerHolepunchAck {
        peer: MemberId,
        tag: u64,
        observed: SocketAddr,
    },
    /// 멤버 → 멤버 직접 펀칭
    PeerHolepunch {
        from: MemberId,
        tag: u64,
    },
    /// 펀칭 응답, `observed`는 응답자가 본 요청자 주소
    PeerHolepunchAck {
        from: MemberId,
        tag: u64,
        observed: SocketAddr,
    },
    Ping {
        from: MemberId,
        seq: u32,
    },
    Pong {
        from: MemberId,
        seq: u32,
    },
    MtuProbe {
        from: MemberId,
        seq: u32,
        padding: Bytes,
    },
    MtuProbeAck {
        from: MemberId,
        seq: u32,
    },
    PeerFrame {
        from: MemberId,
        frame: ReliableFrame,
    },
    PeerUnreliable {
        from: MemberId,
        payload: Bytes,
    },
}

impl Datagram {
    /// bincode 직렬화
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// bincode 역직렬화
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// 직접 경로 데이터그램의 송신 멤버
    pub fn peer_sender(&self) -> Option<MemberId> {
        match self {
            Datagram::PeerHolepunch { from, .. }
            | Datagram::PeerHolepunchAck { from, .. }
            | Datagram::Ping { from, .. }
            | Datagram::Pong { from, .. }
            | Datagram::MtuProbe { from, .. }
            | Datagram::MtuProbeAck { from, .. }
            | Datagram::PeerFrame { from, .. }
            | Datagram::PeerUnreliable { from, .. } => Some(*from),
            Datagram::ServerHolepunch { .. }
            | Datagram::ServerHolepunchAck { .. }
            | Datagram::PeerUdpServerHolepunch { .. }
            | Datagram::PeerUdpServerHolepunchAck { .. } => None,
        }
    }
}

/// 릴레이 코어가 내보내는 송신 지시
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transmit {
    /// 멤버 TCP 연결로
    Tcp { to: MemberId, message: ServerMessage },

    /// 릴레이 UDP 소켓 `from`에서 `to`로 (조각 단위)
    Udp {
        from: SocketAddr,
        to: SocketAddr,
        datagram: Bytes,
    },

    /// 멤버 연결 종료
    Close { member: MemberId },
}
