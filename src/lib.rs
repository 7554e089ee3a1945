//! # relaypunch
//!
//! 릴레이 중재형 P2P 네트워킹 미들웨어
//!
//! ## 핵심 특징
//! - **릴레이 우선**: 모든 멤버는 TCP로 릴레이에 붙고, 직접 경로가 없으면 릴레이로 전달
//! - **홀펀칭 조정**: 릴레이가 양쪽의 관측 주소를 교환하고 동시 펀칭을 지시
//! - **재시도/백오프**: 실패한 페어는 지수 백오프로 재시도, 상한 초과 시 릴레이 전용
//! - **매핑 재활용**: 짧은 이탈 후 재참가 시 이전 NAT 매핑을 재사용
//! - **신뢰 채널**: 손실/재정렬/중복이 있는 UDP 위의 순서 보장 ARQ
//! - **조각화**: MTU보다 큰 메시지를 조각내고 재조립
//! - **MTU 탐색**: 링크별 최대 페이로드 크기 탐색

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod fragment;
pub mod group;
pub mod member;
pub mod message;
pub mod mtu;
pub mod pair;
pub mod relay;
pub mod reliable;
pub mod session;
pub mod sim;
pub mod socket_pool;
pub mod stats;
pub mod traversal;

pub use client::PeerClient;
pub use config::{Config, StartPolicy};
pub use error::{Error, Result};
pub use fragment::{DefragBoard, Fragment, FragmentHeader, Fragmenter, PushResult, SenderKey};
pub use group::{GroupId, GroupMembership};
pub use member::{Member, MemberId, MemberIdPool, RecycleInfo};
pub use message::{ClientMessage, Datagram, RelayPayload, ServerMessage, Transmit};
pub use mtu::MtuProbe;
pub use pair::{with_ordered_locks, ConnectionPairState, PairPhase};
pub use relay::{RelayCore, RelayServer};
pub use reliable::{FrameType, ReliableChannel, ReliableFrame};
pub use session::{ClientTransmit, Path, PeerSession, SessionEvent};
pub use stats::LinkStats;
pub use traversal::{InitOutcome, TraversalCoordinator};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (TCP 프레임 식별용)
pub const MAGIC_NUMBER: u32 = 0x52505550; // "RPUP"

/// UDP 조각 식별 바이트
pub const FRAGMENT_MAGIC: u8 = 0xF7;

/// 기본 MTU 하한 (바이트)
pub const DEFAULT_MIN_MTU: usize = 508;

/// 기본 MTU 상한 (바이트)
pub const DEFAULT_MAX_MTU: usize = 1400;

/// 재조립 허용 최대 메시지 크기 (1MB)
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;
