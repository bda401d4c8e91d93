//! StreamHost 서버 - 게임 스트리밍 호스트
//!
//! RTSP 협상 → video / audio / control 채널
//! - 합성 비디오 + 무음 오디오 소스 (캡처/인코더는 외부 경계)
//! - 입력 이벤트는 로그로 출력
//!
//! 사용법:
//!   cargo run --release --bin streamhost-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 포트로 실행
//!   cargo run --release --bin streamhost-server
//!
//!   # 고정 키 + 30% FEC
//!   cargo run --release --bin streamhost-server -- --key 00112233445566778899aabbccddeeff --fec 30

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use streamhost::crypto::{derive_key, AesKey, Iv};
use streamhost::session::SessionBackends;
use streamhost::{Config, LogInput, Server, SilentAudio, SyntheticVideo};

/// 서버 실행 설정
struct HostArgs {
    config: Config,
    key: Option<AesKey>,
    iv: Option<Iv>,
    pin: Option<String>,
    salt: [u8; 16],
    frame_size: usize,
}

impl Default for HostArgs {
    fn default() -> Self {
        Self {
            config: Config::default(),
            key: None,
            iv: None,
            pin: None,
            salt: [0u8; 16],
            frame_size: 16 * 1024,
        }
    }
}

fn parse_hex16(value: &str) -> [u8; 16] {
    let bytes = hex::decode(value).expect("유효한 hex 필요");
    bytes.try_into().expect("16바이트(32자리 hex) 필요")
}

fn parse_args() -> HostArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut host = HostArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    host.config.bind_ip = args[i + 1].parse::<IpAddr>().expect("유효한 IP 필요");
                    i += 1;
                }
            }
            "--rtsp-port" => {
                if i + 1 < args.len() {
                    host.config.rtsp_port = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--preset" => {
                if i + 1 < args.len() {
                    let bind_ip = host.config.bind_ip;
                    host.config = match args[i + 1].as_str() {
                        "low-latency" => Config::low_latency(),
                        "unstable" => Config::unstable_network(),
                        _ => Config::default(),
                    };
                    host.config.bind_ip = bind_ip;
                    i += 1;
                }
            }
            "--fec" => {
                if i + 1 < args.len() {
                    host.config.fec_percentage = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--ping-timeout" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    host.config.ping_timeout = Duration::from_secs(secs);
                    i += 1;
                }
            }
            "--hevc" => {
                host.config.hevc_enabled = true;
            }
            "--key" | "-k" => {
                if i + 1 < args.len() {
                    host.key = Some(parse_hex16(&args[i + 1]));
                    i += 1;
                }
            }
            "--iv" => {
                if i + 1 < args.len() {
                    host.iv = Some(parse_hex16(&args[i + 1]));
                    i += 1;
                }
            }
            "--pin" => {
                if i + 1 < args.len() {
                    host.pin = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--salt" => {
                if i + 1 < args.len() {
                    host.salt = parse_hex16(&args[i + 1]);
                    i += 1;
                }
            }
            "--frame-size" => {
                if i + 1 < args.len() {
                    host.frame_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"StreamHost Server - 게임 스트리밍 호스트

RTSP 협상 후 FEC 비디오 / 오디오 / 암호화 입력 채널 제공
- Reed-Solomon FEC (reed-solomon-erasure, 시작 시 엔진 선택)
- AES-128-GCM rolling IV 입력 채널

사용법:
  cargo run --release --bin streamhost-server -- [OPTIONS]

옵션:
  -b, --bind <IP>          바인드 IP (기본: 0.0.0.0)
  --rtsp-port <PORT>       RTSP 포트 (기본: 48010)
  --preset <NAME>          low-latency | unstable
  --fec <PERCENT>          FEC 비율 (기본: 20)
  --ping-timeout <SECS>    control 무응답 허용 시간 (기본: 10)
  --hevc                   HEVC 허용
  -k, --key <HEX>          입력 채널 키 (32자리 hex, 기본: 무작위)
  --iv <HEX>               초기 IV (32자리 hex, 기본: 무작위)
  --pin <PIN>              PIN에서 키 유도 (--salt와 함께)
  --salt <HEX>             키 유도 salt (32자리 hex)
  --frame-size <BYTES>     합성 비디오 프레임 크기 (기본: 16384)
  -h, --help               이 도움말 출력

로그 레벨은 RUST_LOG 환경변수로 지정 (기본: info)

예시:
  # 기본 실행
  cargo run --release --bin streamhost-server

  # 고정 키로 실행 (probe와 함께 사용)
  cargo run --release --bin streamhost-server -- -k 00112233445566778899aabbccddeeff --iv 000102030405060708090a0b0c0d0e0f
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    host
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let host = parse_args();

    info!("StreamHost Server starting...");
    info!("FEC percentage: {}%", host.config.fec_percentage);
    info!("Ping timeout: {:?}", host.config.ping_timeout);
    info!("HEVC: {}", if host.config.hevc_enabled { "enabled" } else { "disabled" });

    let backends = SessionBackends {
        video: Arc::new(SyntheticVideo {
            frame_size: host.frame_size,
            ..SyntheticVideo::default()
        }),
        audio: Arc::new(SilentAudio::default()),
        input: Arc::new(LogInput),
    };

    let server = Server::bind(host.config, backends)?;

    {
        let controller = server.controller();
        let mut controller = controller.lock();
        let (random_key, random_iv) = controller.launch_keys();

        let key = match (&host.pin, host.key) {
            (_, Some(key)) => key,
            (Some(pin), None) => derive_key(&host.salt, pin),
            (None, None) => random_key,
        };
        let iv = host.iv.unwrap_or(random_iv);
        controller.set_launch_keys(key, iv);

        debug!("Input key: {}", hex::encode(key));
        debug!("Input IV: {}", hex::encode(iv));
    }

    info!("Server listening on {}", server.local_addr()?);
    server.run()?;
    Ok(())
}
