//! relaypunch 릴레이 서버
//!
//! 멤버 TCP 연결을 받아 그룹을 관리하고 그룹 멤버 간 UDP 홀펀칭을 조정한다.
//! 직접 경로가 없는 피어 트래픽은 TCP로 중계한다.
//!
//! 사용법:
//!   cargo run --release --bin relaypunch-relay -- [OPTIONS]
//!
//! 예시:
//!   # 기본 포트 (TCP 9100, UDP 9101~9104)
//!   cargo run --release --bin relaypunch-relay
//!
//!   # JIT 정책 + 저지연 프리셋
//!   cargo run --release --bin relaypunch-relay -- --bind 0.0.0.0:7000 --jit --preset low-latency

use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use relaypunch::{Config, RelayServer, StartPolicy};

/// 서버 실행 설정
struct ServerArgs {
    bind_addr: SocketAddr,
    udp_base_port: Option<u16>,
    config: Config,
}

fn parse_args() -> Result<ServerArgs, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = ServerArgs {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
        udp_base_port: None,
        config: Config::default(),
    };
    let mut jit = false;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind" | "-b", Some(value)) => {
                parsed.bind_addr = value.parse()?;
                i += 1;
            }
            ("--udp-base" | "-u", Some(value)) => {
                parsed.udp_base_port = Some(value.parse()?);
                i += 1;
            }
            ("--udp-count" | "-n", Some(value)) => {
                parsed.config.relay.udp_socket_count = value.parse()?;
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
            ("--retries", Some(value)) => {
                parsed.config.traversal.max_retry_attempts = value.parse()?;
                i += 1;
            }
            ("--jit", _) => jit = true,
            ("--help" | "-h", _) => {
                println!(
                    r#"relaypunch-relay - 릴레이 중재형 P2P 서버

사용법:
  cargo run --release --bin relaypunch-relay -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       TCP 바인드 주소 (기본: 0.0.0.0:9100)
  -u, --udp-base <PORT>   릴레이 UDP 시작 포트 (기본: TCP 포트 + 1)
  -n, --udp-count <N>     릴레이 UDP 소켓 수 (기본: 4)
  -p, --preset <NAME>     설정 프리셋: default | low-latency | unstable
  --retries <N>           페어별 최대 재시도 횟수 (기본: 5)
  --jit                   JIT 정책 (첫 전송 시 홀펀칭 시작)
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (기본: info)
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
    let base = args
        .udp_base_port
        .unwrap_or_else(|| args.bind_addr.port().wrapping_add(1));
    let udp_addrs: Vec<SocketAddr> = (0..args.config.relay.udp_socket_count)
        .map(|i| SocketAddr::new(args.bind_addr.ip(), base.wrapping_add(i as u16)))
        .collect();

    info!("relaypunch relay starting...");
    info!("Start policy: {:?}", args.config.traversal.start_policy);

    let server = RelayServer::bind(args.config, args.bind_addr, &udp_addrs).await?;
    info!("TCP: {}", server.local_addr()?);
    info!("UDP: {:?}", server.udp_addrs());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("종료 신호 수신"),
    }

    Ok(())
}
