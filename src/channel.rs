//! 채널 스레드
//!
//! - video: PING 대기 → 캡처 스레드 → 재정렬 → FEC 샤드 전송
//! - audio: PING 대기 → 캡처 스레드 → RTP 전송
//! - control: 메시지 디스패치 + ping timeout 감시

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::control::{self, ControlMessageType, ControlServer, ControlTransport};
use crate::crypto::GcmContext;
use crate::input::InputSink;
use crate::packet::{AudioFramer, VideoFramer};
use crate::queue::Queue;
use crate::reorder::FrameReorder;
use crate::session::{SessionShared, StreamConfig};
use crate::source::{AudioPacket, AudioSource, VideoPacket, VideoSource};
use crate::{Config, Error, PING_MAGIC};

/// PING 대기 중 종료 여부를 확인하는 주기
const PING_POLL: Duration = Duration::from_millis(100);

/// 샤드 수 초과 시 프로세스 종료 코드
pub const EXIT_TOO_MANY_SHARDS: i32 = 9;

/// 클라이언트의 PING을 기다려 peer 주소를 얻음
///
/// 대기 시간 초과 또는 세션 종료 시 None
pub fn recv_peer(socket: &UdpSocket, shared: &SessionShared, wait: Duration) -> Option<SocketAddr> {
    let deadline = Instant::now() + wait;
    let mut buf = [0u8; 2048];

    while !shared.is_terminated() {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }

        let slice = (deadline - now).min(PING_POLL).max(Duration::from_millis(1));
        if let Err(e) = socket.set_read_timeout(Some(slice)) {
            warn!("read timeout 설정 실패: {}", e);
            return None;
        }

        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                if buf[..len] == PING_MAGIC {
                    info!("PING from [{}]", peer);
                    return Some(peer);
                }
                warn!("Unknown transmission from {}: [{}]", peer, hex::encode(&buf[..len]));
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!("PING 수신 에러: {}", e);
                return None;
            }
        }
    }

    None
}

/// 비디오 채널
pub fn video_thread(
    socket: UdpSocket,
    shared: Arc<SessionShared>,
    queue: Arc<Queue<VideoPacket>>,
    source: Arc<dyn VideoSource>,
    stream: StreamConfig,
    config: Config,
) {
    let Some(peer) = recv_peer(&socket, &shared, config.ping_wait) else {
        debug!("video: PING 없음, 채널 종료");
        return;
    };

    let capture = {
        let shared = shared.clone();
        let queue = queue.clone();
        let stream = stream.clone();
        thread::Builder::new()
            .name("video-capture".into())
            .spawn(move || source.capture(&stream, &queue, &shared.keyframe_requested))
    };
    let capture = match capture {
        Ok(handle) => handle,
        Err(e) => {
            error!("video 캡처 스레드 생성 실패: {}", e);
            return;
        }
    };

    let mut reorder = FrameReorder::new(config.reorder_window);
    let mut framer = VideoFramer::new(stream.packet_size, stream.fec_percentage);
    let mut reported_drops = 0u64;

    while let Some(packet) = queue.pop() {
        if shared.is_terminated() {
            break;
        }

        reorder.push(packet);

        while let Some(frame) = reorder.pop_ready() {
            let shards = match framer.frame(&frame) {
                Ok(shards) => shards,
                Err(Error::TooManyShards { shards, max }) => {
                    error!(
                        "frame {}: 샤드 수 {}가 최대 {}를 초과, 프로세스 종료",
                        frame.frame_index, shards, max
                    );
                    std::process::exit(EXIT_TOO_MANY_SHARDS);
                }
                Err(e) => {
                    warn!("frame {} 프레이밍 실패: {}", frame.frame_index, e);
                    continue;
                }
            };

            let mut sent = 0usize;
            for shard in shards.iter() {
                match socket.send_to(shard, peer) {
                    Ok(n) => sent += n,
                    Err(e) => warn!("video 전송 에러: {}", e),
                }
            }

            shared
                .stats
                .lock()
                .record_frame(shards.len(), shards.parity_shards, sent);
        }

        let drops = reorder.dropped();
        if drops > reported_drops {
            shared.stats.lock().dropped_frames += drops - reported_drops;
            reported_drops = drops;
        }
    }

    queue.stop();
    if capture.join().is_err() {
        warn!("video 캡처 스레드 panic");
    }
    debug!("video 채널 종료");
}

/// 오디오 채널
pub fn audio_thread(
    socket: UdpSocket,
    shared: Arc<SessionShared>,
    queue: Arc<Queue<AudioPacket>>,
    source: Arc<dyn AudioSource>,
    stream: StreamConfig,
    config: Config,
) {
    let Some(peer) = recv_peer(&socket, &shared, config.ping_wait) else {
        debug!("audio: PING 없음, 채널 종료");
        return;
    };

    let capture = {
        let queue = queue.clone();
        let stream = stream.clone();
        thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || source.capture(&stream, &queue))
    };
    let capture = match capture {
        Ok(handle) => handle,
        Err(e) => {
            error!("audio 캡처 스레드 생성 실패: {}", e);
            return;
        }
    };

    let mut framer = AudioFramer::new();

    while let Some(packet) = queue.pop() {
        if shared.is_terminated() {
            break;
        }

        let datagram = framer.frame(&packet.data);
        match socket.send_to(&datagram, peer) {
            Ok(n) => shared.stats.lock().record_audio(n),
            Err(e) => warn!("audio 전송 에러: {}", e),
        }
    }

    queue.stop();
    if capture.join().is_err() {
        warn!("audio 캡처 스레드 panic");
    }
    debug!("audio 채널 종료");
}

/// control 핸들러 등록
fn register_handlers<T: ControlTransport>(
    server: &mut ControlServer<T>,
    shared: &Arc<SessionShared>,
    mut gcm: GcmContext,
    sink: Arc<dyn InputSink>,
) {
    server.map(ControlMessageType::StartA, |_| debug!("type [START_A]"));
    server.map(ControlMessageType::StartB, |_| debug!("type [START_B]"));

    let s = shared.clone();
    server.map(ControlMessageType::InvalidateRefFrames, move |payload| {
        match control::parse_invalidate_ref_frames(payload) {
            Ok((first, last)) => {
                info!("참조 프레임 무효화: {}..={}, 키프레임 요청", first, last);
                s.keyframe_requested.store(true, std::sync::atomic::Ordering::SeqCst);
                s.stats.lock().keyframe_requests += 1;
            }
            Err(e) => warn!("{}", e),
        }
    });

    let s = shared.clone();
    server.map(ControlMessageType::LossStats, move |payload| {
        match control::parse_loss_stats(payload) {
            Ok(report) => {
                debug!(
                    "loss stats: count={} interval={}ms last_good_frame={}",
                    report.count, report.interval_ms, report.last_good_frame
                );
                s.stats.lock().record_loss(report);
            }
            Err(e) => warn!("{}", e),
        }
    });

    server.map(ControlMessageType::FrameStats, |_| {});

    let s = shared.clone();
    server.map(ControlMessageType::InputData, move |payload| {
        match control::decode_input(&mut gcm, payload) {
            Ok(event) => {
                sink.inject(event);
                s.stats.lock().input_events += 1;
            }
            Err(Error::Crypto(e)) => {
                error!("failed to verify tag: {}, 세션 종료", e);
                s.terminate();
            }
            Err(e) => warn!("입력 패킷 버림: {}", e),
        }
    });

    server.map(ControlMessageType::RumbleData, |payload| {
        debug!("type [RUMBLE_DATA] {} bytes", payload.len());
    });

    let s = shared.clone();
    server.map(ControlMessageType::Termination, move |_| {
        info!("클라이언트 종료 요청");
        s.terminate();
    });
}

/// control 채널
pub fn control_thread<T: ControlTransport>(
    transport: T,
    shared: Arc<SessionShared>,
    gcm: GcmContext,
    sink: Arc<dyn InputSink>,
    config: Config,
) {
    let mut server = ControlServer::new(transport);
    register_handlers(&mut server, &shared, gcm, sink);

    while !shared.is_terminated() {
        if shared.ping_expired() {
            warn!("ping timeout ({:?}), 세션 종료", config.ping_timeout);
            shared.terminate();
            break;
        }

        match server.iterate(config.control_poll) {
            Ok(Some(_)) => shared.refresh_ping(config.ping_timeout),
            Ok(None) => {}
            Err(e) => {
                warn!("control 수신 에러: {}", e);
                thread::sleep(config.control_poll);
            }
        }
    }

    debug!("control 채널 종료");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::control::{encode_input, encode_message, UdpControlTransport};
    use crate::input::{ChannelInput, InputEvent, PACKET_TYPE_SCROLL_OR_KEYBOARD};
    use crate::session::SessionState;

    fn streaming_shared(timeout: Duration) -> Arc<SessionShared> {
        let shared = Arc::new(SessionShared::new());
        shared.set_state(SessionState::Streaming);
        shared.refresh_ping(timeout);
        shared
    }

    #[test]
    fn test_recv_peer_ping() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let shared = streaming_shared(Duration::from_secs(5));

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"HELLO", addr).unwrap();
        client.send_to(&PING_MAGIC, addr).unwrap();

        let peer = recv_peer(&socket, &shared, Duration::from_secs(2));
        assert_eq!(peer, Some(client.local_addr().unwrap()));
    }

    #[test]
    fn test_recv_peer_timeout() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let shared = streaming_shared(Duration::from_secs(5));

        let start = Instant::now();
        assert_eq!(recv_peer(&socket, &shared, Duration::from_millis(150)), None);
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_recv_peer_aborts_on_terminate() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let shared = streaming_shared(Duration::from_secs(5));
        shared.terminate();

        assert_eq!(recv_peer(&socket, &shared, Duration::from_secs(10)), None);
    }

    #[test]
    fn test_control_ping_timeout() {
        let transport = UdpControlTransport::bind("127.0.0.1:0").unwrap();
        let shared = streaming_shared(Duration::from_millis(100));
        let config = Config {
            ping_timeout: Duration::from_millis(100),
            control_poll: Duration::from_millis(10),
            ..Config::loopback()
        };

        let start = Instant::now();
        control_thread(
            transport,
            shared.clone(),
            GcmContext::new([0u8; 16], [0u8; 16]),
            Arc::new(crate::input::LogInput),
            config,
        );
        assert!(shared.is_terminated());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_control_input_and_tag_failure() {
        let key = [5u8; 16];
        let iv = [6u8; 16];

        let transport = UdpControlTransport::bind("127.0.0.1:0").unwrap();
        let addr = transport.local_addr().unwrap();
        let shared = streaming_shared(Duration::from_secs(5));
        let config = Config {
            control_poll: Duration::from_millis(10),
            ..Config::loopback()
        };

        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = {
            let shared = shared.clone();
            thread::spawn(move || {
                control_thread(
                    transport,
                    shared,
                    GcmContext::new(key, iv),
                    Arc::new(ChannelInput::new(tx)),
                    config,
                )
            })
        };

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut gcm = GcmContext::new(key, iv);

        let mut scroll = vec![0, 0, 0, PACKET_TYPE_SCROLL_OR_KEYBOARD as u8, 0x0A, 0, 0, 0];
        scroll.extend_from_slice(&(-3i16).to_be_bytes());
        let msg = encode_message(ControlMessageType::InputData, &encode_input(&mut gcm, &scroll));
        client.send_to(&msg, addr).unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            InputEvent::Scroll { amount: -3 }
        );
        assert!(!shared.is_terminated());

        // 다른 키로 암호화된 입력 → 세션 종료
        let mut wrong = GcmContext::new([0xEE; 16], *gcm.iv());
        let msg = encode_message(ControlMessageType::InputData, &encode_input(&mut wrong, &scroll));
        client.send_to(&msg, addr).unwrap();

        handle.join().unwrap();
        assert!(shared.is_terminated());
        assert_eq!(shared.stats.lock().input_events, 1);
    }

    #[test]
    fn test_control_termination_message() {
        let transport = UdpControlTransport::bind("127.0.0.1:0").unwrap();
        let addr = transport.local_addr().unwrap();
        let shared = streaming_shared(Duration::from_secs(5));
        let config = Config {
            control_poll: Duration::from_millis(10),
            ..Config::loopback()
        };

        let handle = {
            let shared = shared.clone();
            thread::spawn(move || {
                control_thread(
                    transport,
                    shared,
                    GcmContext::new([0u8; 16], [0u8; 16]),
                    Arc::new(crate::input::LogInput),
                    config,
                )
            })
        };

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut invalidate = Vec::new();
        invalidate.extend_from_slice(&3i64.to_le_bytes());
        invalidate.extend_from_slice(&5i64.to_le_bytes());
        client
            .send_to(&encode_message(ControlMessageType::InvalidateRefFrames, &invalidate), addr)
            .unwrap();
        client
            .send_to(&encode_message(ControlMessageType::Termination, &[]), addr)
            .unwrap();

        handle.join().unwrap();
        assert!(shared.is_terminated());
        assert!(shared.keyframe_requested.load(Ordering::SeqCst));
    }

    /// 순서를 섞어 넣는 소스
    struct ShuffledVideo;

    impl VideoSource for ShuffledVideo {
        fn capture(&self, _config: &StreamConfig, queue: &Queue<VideoPacket>, _kf: &std::sync::atomic::AtomicBool) {
            for idx in [2u32, 1, 3, 5, 4] {
                let packet = VideoPacket {
                    frame_index: idx,
                    data: bytes::Bytes::from(vec![0x80u8; 100]),
                    keyframe: idx == 1,
                };
                if !queue.push(packet) {
                    return;
                }
            }
        }
    }

    #[test]
    fn test_video_thread_sends_in_order() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let shared = streaming_shared(Duration::from_secs(5));
        let queue = Arc::new(Queue::bounded(8));
        let stream = StreamConfig {
            packet_size: 1024,
            ..StreamConfig::default()
        };

        let handle = {
            let shared = shared.clone();
            let queue = queue.clone();
            thread::spawn(move || {
                video_thread(socket, shared, queue, Arc::new(ShuffledVideo), stream, Config::loopback())
            })
        };

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.send_to(&PING_MAGIC, addr).unwrap();

        let mut frames = Vec::new();
        let mut buf = [0u8; 2048];
        while frames.len() < 5 {
            let (len, _) = client.recv_from(&mut buf).unwrap();
            let header = crate::packet::VideoHeader::parse(&buf[..len]).unwrap();
            if frames.last() != Some(&header.frame_index) {
                frames.push(header.frame_index);
            }
        }
        assert_eq!(frames, vec![1, 2, 3, 4, 5]);

        shared.terminate();
        queue.stop();
        handle.join().unwrap();
        assert_eq!(shared.stats.lock().frames, 5);
    }
}
