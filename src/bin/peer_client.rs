//! relaypunch 피어 클라이언트
//!
//! 릴레이에 붙어 그룹에 참가하고, 피어가 들어오면 메시지를 보낸다.
//! 받은 메시지와 링크 상태 변화를 로그로 출력한다.
//!
//! 사용법:
//!   cargo run --release --bin relaypunch-peer -- [OPTIONS]
//!
//! 예시:
//!   # 그룹 1 참가 후 인사 메시지 전송
//!   cargo run --release --bin relaypunch-peer -- --relay 127.0.0.1:9100 --group 1 --message hello

use std::net::SocketAddr;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use relaypunch::{Config, PeerClient, SessionEvent, StartPolicy};

/// 클라이언트 실행 설정
struct ClientArgs {
    relay_addr: SocketAddr,
    group: u32,
    message: Option<String>,
    config: Config,
}

fn parse_args() -> Result<ClientArgs, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = ClientArgs {
        relay_addr: SocketAddr::from(([127, 0, 0, 1], 9100)),
        group: 1,
        message: None,
        config: Config::default(),
    };
    let mut jit = false;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--relay" | "-r", Some(value)) => {
                parsed.relay_addr = value.parse()?;
                i += 1;
            }
            ("--group" | "-g", Some(value)) => {
                parsed.group = value.parse()?;
                i += 1;
            }
            ("--message" | "-m", Some(value)) => {
                parsed.message = Some(value.clone());
                i += 1;
            }
            ("--preset" | "-p", Some(value)) => {
                parsed.config = match value.as_str() {
                    "low-latency" => Config::low_latency(),
                    "unstable" => Config::unstable_network(),
                    _ => Config::default(),
                };
                i += 1;
            }
            ("--jit", _) => jit = true,
            ("--help" | "-h", _) => {
                println!(
                    r#"relaypunch-peer - 릴레이 중재형 P2P 클라이언트

사용법:
  cargo run --release --bin relaypunch-peer -- [OPTIONS]

옵션:
  -r, --relay <ADDR>      릴레이 TCP 주소 (기본: 127.0.0.1:9100)
  -g, --group <ID>        참가할 그룹 (기본: 1)
  -m, --message <TEXT>    피어 참가 시 보낼 메시지
  -p, --preset <NAME>     설정 프리셋: default | low-latency | unstable
  --jit                   JIT 정책 (릴레이와 같게 설정)
  -h, --help              이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    if jit {
        parsed.config.traversal.start_policy = StartPolicy::JustInTime;
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;
    info!("relaypunch peer starting...");
    info!("Relay address: {}", args.relay_addr);

    let mut client = PeerClient::connect(args.config, args.relay_addr).await?;
    client.join(args.group);

    loop {
        let event = tokio::select! {
            event = client.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("종료 신호 수신");
                break;
            }
        };
        let Some(event) = event else {
            warn!("릴레이 연결이 끊어짐");
            break;
        };

        match event {
            SessionEvent::Connected { member } => info!("멤버 ID: {}", member),
            SessionEvent::PeerJoined { peer } => {
                info!("피어 참가: {}", peer);
                if let Some(message) = &args.message {
                    if let Err(e) = client.send(peer, message.as_bytes()) {
                        warn!("전송 실패 -> {}: {}", peer, e);
                    }
                }
            }
            SessionEvent::DirectP2PReady {
                peer,
                holepunch_initiated,
                remote,
                ..
            } => info!(
                "직접 P2P 성립: {} @ {} (holepunch={})",
                peer, remote, holepunch_initiated
            ),
            SessionEvent::Message {
                from,
                payload,
                path,
            } => info!(
                "메시지 from {} ({:?}): {}",
                from,
                path,
                String::from_utf8_lossy(&payload)
            ),
            other => info!("{:?}", other),
        }
    }

    client.close();
    Ok(())
}
