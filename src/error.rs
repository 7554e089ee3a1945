//! 에러 타입 정의

use thiserror::Error;

use crate::member::MemberId;

/// 릴레이/P2P 미들웨어 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("프레임 크기 초과: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("메시지 크기 초과: {len} > {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("MTU가 너무 작음: {mtu}")]
    MtuTooSmall { mtu: usize },

    #[error("조각 길이 불일치: packet_id={packet_id}, expected {expected}, got {got}")]
    FragmentLengthMismatch {
        packet_id: u32,
        expected: u32,
        got: u32,
    },

    #[error("유효하지 않은 조각: packet_id={packet_id}, fragment_id={fragment_id}")]
    InvalidFragment { packet_id: u32, fragment_id: u16 },

    #[error("잘린 데이터그램: {len} bytes")]
    TruncatedDatagram { len: usize },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("알 수 없는 멤버: {0}")]
    UnknownMember(MemberId),

    #[error("알 수 없는 피어: {0}")]
    UnknownPeer(MemberId),

    #[error("그룹에 속해 있지 않음: {0}")]
    NotInGroup(MemberId),

    #[error("이미 그룹에 속해 있음: member={member}, group={group}")]
    AlreadyInGroup { member: MemberId, group: u32 },

    #[error("릴레이에 연결되지 않음")]
    NotConnected,

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 연결 자체를 끊어야 하는 전송 계층 오류인지 여부
    ///
    /// 나머지 오류는 모두 로그 후 패킷 폐기로 흡수된다.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidMagicNumber { .. }
                | Error::InvalidVersion { .. }
                | Error::FrameTooLarge { .. }
                | Error::Serialization(_)
                | Error::Io(_)
                | Error::ConnectionClosed
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
