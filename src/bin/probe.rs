//! StreamHost 프로브 - 테스트 클라이언트
//!
//! RTSP 협상 → PING → 비디오 샤드 수신/검증 → 종료 메시지
//! - 키를 지정하면 암호화된 마우스 이동 입력도 전송
//!
//! 사용법:
//!   cargo run --release --bin streamhost-probe -- [OPTIONS]
//!
//! 예시:
//!   # 로컬 서버에서 프레임 120개 수신
//!   cargo run --release --bin streamhost-probe -- --host 127.0.0.1 --frames 120

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use streamhost::control::{encode_input, encode_message};
use streamhost::input::PACKET_TYPE_MOUSE_MOVE;
use streamhost::rtsp::{Request, Response};
use streamhost::{
    ControlMessageType, GcmContext, VideoHeader, AUDIO_STREAM_PORT, CONTROL_PORT, PING_MAGIC,
    RTSP_SETUP_PORT, VIDEO_STREAM_PORT,
};

/// 프로브 설정
struct ProbeArgs {
    host: IpAddr,
    rtsp_port: u16,
    video_port: u16,
    audio_port: u16,
    control_port: u16,
    frames: u32,
    packet_size: usize,
    fps: u32,
    key: Option<[u8; 16]>,
    iv: [u8; 16],
}

impl Default for ProbeArgs {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".parse().unwrap(),
            rtsp_port: RTSP_SETUP_PORT,
            video_port: VIDEO_STREAM_PORT,
            audio_port: AUDIO_STREAM_PORT,
            control_port: CONTROL_PORT,
            frames: 60,
            packet_size: 1024,
            fps: 60,
            key: None,
            iv: [0u8; 16],
        }
    }
}

fn parse_hex16(value: &str) -> [u8; 16] {
    let bytes = hex::decode(value).expect("유효한 hex 필요");
    bytes.try_into().expect("16바이트(32자리 hex) 필요")
}

fn parse_args() -> ProbeArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut probe = ProbeArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" | "-s" => {
                if i + 1 < args.len() {
                    probe.host = args[i + 1].parse().expect("유효한 IP 필요");
                    i += 1;
                }
            }
            "--rtsp-port" => {
                if i + 1 < args.len() {
                    probe.rtsp_port = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--video-port" => {
                if i + 1 < args.len() {
                    probe.video_port = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--audio-port" => {
                if i + 1 < args.len() {
                    probe.audio_port = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--control-port" => {
                if i + 1 < args.len() {
                    probe.control_port = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--frames" | "-n" => {
                if i + 1 < args.len() {
                    probe.frames = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--packet-size" => {
                if i + 1 < args.len() {
                    probe.packet_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--fps" => {
                if i + 1 < args.len() {
                    probe.fps = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--key" | "-k" => {
                if i + 1 < args.len() {
                    probe.key = Some(parse_hex16(&args[i + 1]));
                    i += 1;
                }
            }
            "--iv" => {
                if i + 1 < args.len() {
                    probe.iv = parse_hex16(&args[i + 1]);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"StreamHost Probe - 테스트 클라이언트

RTSP 협상 후 비디오 샤드를 받아 헤더를 검증하고 종료 메시지 전송

사용법:
  cargo run --release --bin streamhost-probe -- [OPTIONS]

옵션:
  -s, --host <IP>          서버 IP (기본: 127.0.0.1)
  --rtsp-port <PORT>       RTSP 포트 (기본: 48010)
  --video-port <PORT>      비디오 포트 (기본: 47998)
  --audio-port <PORT>      오디오 포트 (기본: 48000)
  --control-port <PORT>    control 포트 (기본: 47999)
  -n, --frames <N>         수신할 프레임 수 (기본: 60)
  --packet-size <BYTES>    요청할 packetSize (기본: 1024)
  --fps <N>                요청할 maxFPS (기본: 60)
  -k, --key <HEX>          입력 채널 키, 지정 시 마우스 입력 전송
  --iv <HEX>               초기 IV (기본: 0)
  -h, --help               이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    probe
}

fn announce_payload(probe: &ProbeArgs) -> String {
    let attrs = [
        "v=0".to_string(),
        "o=probe 0 14 IN IPv4 127.0.0.1".to_string(),
        "s=streamhost-probe".to_string(),
        "a=x-nv-video[0].clientViewportWd:1280 ".to_string(),
        "a=x-nv-video[0].clientViewportHt:720 ".to_string(),
        format!("a=x-nv-video[0].maxFPS:{} ", probe.fps),
        format!("a=x-nv-video[0].packetSize:{} ", probe.packet_size),
        "a=x-nv-video[0].initialBitrateKbps:10000 ".to_string(),
        "a=x-nv-video[0].videoEncoderSlicesPerFrame:1 ".to_string(),
        "a=x-nv-audio.surround.numChannels:2 ".to_string(),
        "a=x-nv-audio.surround.channelMask:3 ".to_string(),
        "a=x-nv-aqos.packetDuration:5 ".to_string(),
        "t=0 0".to_string(),
        String::new(),
    ];
    attrs.join("\r\n")
}

/// 요청 하나 = TCP 연결 하나
fn rtsp(addr: SocketAddr, req: Request) -> Result<Response, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(&req.serialize())?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    let resp = Response::parse(&buf)?;
    info!("{} {} -> {} {}", req.command, req.target, resp.code, resp.status);
    Ok(resp)
}

fn mouse_move(dx: i16, dy: i16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&PACKET_TYPE_MOUSE_MOVE.to_be_bytes());
    buf.extend_from_slice(&[0x06, 0x00, 0x00, 0x00]);
    buf.extend_from_slice(&dx.to_be_bytes());
    buf.extend_from_slice(&dy.to_be_bytes());
    buf
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let probe = parse_args();
    let rtsp_addr = SocketAddr::new(probe.host, probe.rtsp_port);
    info!("StreamHost Probe → {}", rtsp_addr);

    // ═══════════════════════════════════════════════════════════════
    // RTSP 협상
    // ═══════════════════════════════════════════════════════════════
    let target = format!("rtsp://{}:{}", probe.host, probe.rtsp_port);
    let mut cseq = 1u32;
    let mut next = |command: &str, target: &str| {
        let req = Request::new(command, target).with_header("CSeq", cseq);
        cseq += 1;
        req
    };

    rtsp(rtsp_addr, next("OPTIONS", &target))?;
    let describe = rtsp(rtsp_addr, next("DESCRIBE", &target))?;
    info!("DESCRIBE payload: {}", describe.payload);
    rtsp(rtsp_addr, next("SETUP", "streamid=audio/0/0"))?;
    rtsp(rtsp_addr, next("SETUP", "streamid=video/0/0"))?;
    rtsp(rtsp_addr, next("SETUP", "streamid=control/1/0"))?;

    let announce = rtsp(
        rtsp_addr,
        next("ANNOUNCE", "streamid=video").with_payload(announce_payload(&probe)),
    )?;
    if announce.code != 200 {
        return Err(format!("ANNOUNCE 거부: {} {}", announce.code, announce.status).into());
    }
    rtsp(rtsp_addr, next("PLAY", "/"))?;

    // ═══════════════════════════════════════════════════════════════
    // 스트림 채널
    // ═══════════════════════════════════════════════════════════════
    let control_addr = SocketAddr::new(probe.host, probe.control_port);
    let control = UdpSocket::bind("0.0.0.0:0")?;
    control.send_to(&encode_message(ControlMessageType::StartA, &[]), control_addr)?;
    control.send_to(&encode_message(ControlMessageType::StartB, &[]), control_addr)?;

    let stop = Arc::new(AtomicBool::new(false));
    let audio_packets = Arc::new(AtomicU64::new(0));
    let audio_task = {
        let stop = stop.clone();
        let audio_packets = audio_packets.clone();
        let audio_addr = SocketAddr::new(probe.host, probe.audio_port);
        let audio = UdpSocket::bind("0.0.0.0:0")?;
        audio.set_read_timeout(Some(Duration::from_millis(200)))?;
        audio.send_to(&PING_MAGIC, audio_addr)?;
        thread::spawn(move || {
            let mut buf = [0u8; 2048];
            while !stop.load(Ordering::Relaxed) {
                if audio.recv_from(&mut buf).is_ok() {
                    audio_packets.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    };

    let video = UdpSocket::bind("0.0.0.0:0")?;
    video.set_read_timeout(Some(Duration::from_secs(2)))?;
    video.send_to(&PING_MAGIC, SocketAddr::new(probe.host, probe.video_port))?;

    let mut gcm = probe.key.map(|key| GcmContext::new(key, probe.iv));

    let start = Instant::now();
    let mut last_keepalive = Instant::now();
    let mut buf = vec![0u8; 65536];
    let mut current_frame = 0u32;
    let mut frames = 0u32;
    let mut shards = 0u64;
    let mut parity = 0u64;
    let mut bytes = 0u64;
    let mut anomalies = 0u64;

    // ─────────────────────────────────────────────────────────────────
    // 비디오 수신 + 헤더 검증
    // ─────────────────────────────────────────────────────────────────
    while frames < probe.frames {
        if last_keepalive.elapsed() >= Duration::from_millis(500) {
            control.send_to(&encode_message(ControlMessageType::StartA, &[]), control_addr)?;
            if let Some(gcm) = gcm.as_mut() {
                let input = encode_input(gcm, &mouse_move(1, -1));
                control.send_to(&encode_message(ControlMessageType::InputData, &input), control_addr)?;
            }
            last_keepalive = Instant::now();
        }

        let len = match video.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) => {
                warn!("비디오 수신 타임아웃: {}", e);
                break;
            }
        };

        let Some(header) = VideoHeader::parse(&buf[..len]) else {
            warn!("헤더 파싱 실패 ({} bytes)", len);
            anomalies += 1;
            continue;
        };

        if header.frame_index != current_frame {
            if current_frame != 0 && header.frame_index != current_frame.wrapping_add(1) {
                warn!("프레임 순서 이상: {} → {}", current_frame, header.frame_index);
                anomalies += 1;
            }
            current_frame = header.frame_index;
            frames += 1;
        }

        if header.fec_index() >= header.fec_data_shards() {
            parity += 1;
        }
        shards += 1;
        bytes += len as u64;
    }

    control.send_to(&encode_message(ControlMessageType::Termination, &[]), control_addr)?;
    stop.store(true, Ordering::Relaxed);
    let _ = audio_task.join();

    let elapsed = start.elapsed();
    info!("Probe complete!");
    info!("  Time: {:.2}s", elapsed.as_secs_f64());
    info!("  Frames: {}", frames);
    info!("  Shards: {} (parity {})", shards, parity);
    info!(
        "  Throughput: {:.2} MB/s",
        bytes as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / 1_000_000.0
    );
    info!("  Audio packets: {}", audio_packets.load(Ordering::Relaxed));
    info!("  Anomalies: {}", anomalies);

    Ok(())
}
