//! 세션 컨트롤러 + RTSP accept 루프
//!
//! - 명령별 핸들러 테이블 (OPTIONS / DESCRIBE / SETUP / ANNOUNCE / PLAY)
//! - 세션은 최대 하나, `Option<Session>`으로 소유
//! - Terminated 세션은 accept 루프가 poll마다, 그리고 요청 처리 직전에 회수

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::crypto::{AesKey, Iv};
use crate::fec;
use crate::rtsp::{Request, Response};
use crate::session::{Session, SessionBackends, StreamAddrs, StreamConfig};
use crate::{Config, Result};

/// 요청 하나의 최대 크기
pub const MAX_REQUEST_SIZE: usize = 2048;

/// 요청 읽기 timeout
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// SETUP audio 응답의 Session 헤더
pub const AUDIO_SESSION: &str = "DEADBEEFCAFE;timeout = 90";

const DESCRIBE_PAYLOAD: &str = "surround-params=NONE";
const DESCRIBE_HEVC_PREFIX: &str = "sprop-parameter-sets=AAAAAU;";

type CommandFn = fn(&mut Controller, &Request) -> Response;

/// RTSP 명령 처리 + 세션 소유
pub struct Controller {
    config: Config,
    backends: SessionBackends,
    key: AesKey,
    iv: Iv,
    session: Option<Session>,
    commands: HashMap<&'static str, CommandFn>,
}

impl Controller {
    /// 무작위 launch 키로 생성
    pub fn new(config: Config, backends: SessionBackends) -> Self {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        rng.fill(&mut key);
        rng.fill(&mut iv);

        let mut commands: HashMap<&'static str, CommandFn> = HashMap::new();
        commands.insert("OPTIONS", Controller::cmd_options);
        commands.insert("DESCRIBE", Controller::cmd_describe);
        commands.insert("SETUP", Controller::cmd_setup);
        commands.insert("ANNOUNCE", Controller::cmd_announce);
        commands.insert("PLAY", Controller::cmd_play);

        Self {
            config,
            backends,
            key,
            iv,
            session: None,
            commands,
        }
    }

    /// 다음 세션에 쓸 대칭키와 초기 IV
    pub fn set_launch_keys(&mut self, key: AesKey, iv: Iv) {
        self.key = key;
        self.iv = iv;
    }

    pub fn launch_keys(&self) -> (AesKey, Iv) {
        (self.key, self.iv)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// 활성 세션의 스트림 소켓 주소
    pub fn session_addrs(&self) -> Option<StreamAddrs> {
        self.session.as_ref().map(Session::addrs)
    }

    /// Terminated 세션 회수, 회수했으면 true
    pub fn reap(&mut self) -> bool {
        if !self.session.as_ref().is_some_and(Session::is_terminated) {
            return false;
        }

        if let Some(mut session) = self.session.take() {
            session.stop();
            info!("세션 회수 완료, Idle");
        }
        true
    }

    /// 활성 세션 강제 종료
    pub fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop();
        }
    }

    /// 요청 하나 처리
    pub fn handle(&mut self, req: &Request) -> Response {
        self.reap();

        debug!("{} {} CSeq={}", req.command, req.target, req.sequence_number());
        match self.commands.get(req.command.as_str()).copied() {
            Some(cmd) => cmd(self, req),
            None => Self::cmd_not_found(req),
        }
    }

    fn cmd_not_found(req: &Request) -> Response {
        Response::not_found(req.sequence_number())
    }

    fn cmd_options(&mut self, req: &Request) -> Response {
        Response::ok(req.sequence_number())
    }

    fn cmd_describe(&mut self, req: &Request) -> Response {
        let payload = if self.config.hevc_enabled {
            format!("{}{}", DESCRIBE_HEVC_PREFIX, DESCRIBE_PAYLOAD)
        } else {
            DESCRIBE_PAYLOAD.to_string()
        };
        Response::ok(req.sequence_number()).with_payload(payload)
    }

    fn cmd_setup(&mut self, req: &Request) -> Response {
        let cseq = req.sequence_number();
        if self.is_active() {
            return Response::service_unavailable(cseq);
        }

        // ...streamid=<type>/...
        let stream_type = req
            .target
            .split_once('=')
            .map(|(_, rest)| rest.split('/').next().unwrap_or_default());

        match stream_type {
            Some("audio") => Response::ok(cseq).with_header("Session", AUDIO_SESSION),
            Some("video") | Some("control") => Response::ok(cseq),
            _ => {
                debug!("알 수 없는 SETUP 대상: {}", req.target);
                Self::cmd_not_found(req)
            }
        }
    }

    fn cmd_announce(&mut self, req: &Request) -> Response {
        let cseq = req.sequence_number();
        if self.is_active() {
            warn!("이미 스트리밍 중, ANNOUNCE 거부");
            return Response::service_unavailable(cseq);
        }

        let stream = match StreamConfig::parse_announce(&req.payload, &self.config) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("ANNOUNCE 거부: {}", e);
                return Response::bad_request(cseq);
            }
        };

        match Session::start(&self.config, stream, self.key, self.iv, &self.backends) {
            Ok(session) => {
                self.session = Some(session);
                Response::ok(cseq)
            }
            Err(e) => {
                error!("세션 시작 실패: {}", e);
                Response::new(500, "Internal Server Error", cseq)
            }
        }
    }

    fn cmd_play(&mut self, req: &Request) -> Response {
        Response::ok(req.sequence_number())
    }
}

/// accept 루프 종료 핸들
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// RTSP 서버
pub struct Server {
    listener: TcpListener,
    controller: Arc<Mutex<Controller>>,
    shutdown: ShutdownHandle,
    accept_poll: Duration,
}

impl Server {
    /// 설정 검증, FEC 백엔드 선택, RTSP 포트 바인드
    pub fn bind(config: Config, backends: SessionBackends) -> Result<Self> {
        config.validate()?;
        fec::init();

        let listener = TcpListener::bind(config.rtsp_addr())?;
        listener.set_nonblocking(true)?;
        info!("RTSP listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            accept_poll: config.accept_poll,
            controller: Arc::new(Mutex::new(Controller::new(config, backends))),
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn controller(&self) -> Arc<Mutex<Controller>> {
        self.controller.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// shutdown까지 accept 루프 실행
    pub fn run(&self) -> Result<()> {
        while !self.shutdown.is_shutdown() {
            self.controller.lock().reap();

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.handle_connection(stream, peer) {
                        warn!("RTSP 연결 처리 에러 ({}): {}", peer, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.accept_poll);
                }
                Err(e) => {
                    warn!("accept 에러: {}", e);
                    thread::sleep(self.accept_poll);
                }
            }
        }

        info!("RTSP 서버 종료");
        self.controller.lock().shutdown();
        Ok(())
    }

    /// 연결당 한 번 읽고 한 번 응답
    fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        let mut buf = [0u8; MAX_REQUEST_SIZE];
        let len = stream.read(&mut buf)?;
        if len == 0 {
            debug!("빈 연결: {}", peer);
            return Ok(());
        }

        let response = match Request::parse(&buf[..len]) {
            Ok(req) => self.controller.lock().handle(&req),
            Err(e) => {
                warn!("{} from {}", e, peer);
                Response::not_found(0)
            }
        };

        debug!("{} -> {} {}", peer, response.code, response.status);
        stream.write_all(&response.serialize())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::time::Instant;

    use super::*;
    use crate::control::{encode_input, encode_message, ControlMessageType};
    use crate::crypto::GcmContext;
    use crate::input::{ChannelInput, InputEvent, LogInput, PACKET_TYPE_MOUSE_MOVE};
    use crate::packet::{VideoHeader, FLAG_SOF, VIDEO_HEADER_SIZE, VIDEO_MAGIC_HEADER};
    use crate::source::{SilentAudio, SyntheticVideo};
    use crate::PING_MAGIC;

    fn announce_payload() -> String {
        [
            "v=0",
            "s=e2e",
            "a=x-nv-video[0].clientViewportWd:1280 ",
            "a=x-nv-video[0].clientViewportHt:720 ",
            "a=x-nv-video[0].maxFPS:60 ",
            "a=x-nv-video[0].packetSize:1024 ",
            "a=x-nv-video[0].initialBitrateKbps:10000 ",
            "a=x-nv-video[0].videoEncoderSlicesPerFrame:1 ",
            "a=x-nv-audio.surround.numChannels:2 ",
            "a=x-nv-audio.surround.channelMask:3 ",
            "a=x-nv-aqos.packetDuration:5 ",
            "",
        ]
        .join("\r\n")
    }

    fn backends() -> SessionBackends {
        SessionBackends {
            video: Arc::new(SyntheticVideo {
                frame_size: 3000,
                interval: Some(Duration::from_millis(5)),
                max_frames: None,
            }),
            audio: Arc::new(SilentAudio::default()),
            input: Arc::new(LogInput),
        }
    }

    struct Running {
        addr: SocketAddr,
        controller: Arc<Mutex<Controller>>,
        shutdown: ShutdownHandle,
        handle: Option<thread::JoinHandle<Result<()>>>,
    }

    impl Running {
        fn start(config: Config, backends: SessionBackends) -> Self {
            let server = Server::bind(config, backends).unwrap();
            let addr = server.local_addr().unwrap();
            let controller = server.controller();
            let shutdown = server.shutdown_handle();
            let handle = thread::spawn(move || server.run());
            Self {
                addr,
                controller,
                shutdown,
                handle: Some(handle),
            }
        }

        fn request(&self, req: Request) -> Response {
            let mut stream = TcpStream::connect(self.addr).unwrap();
            stream.write_all(&req.serialize()).unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).unwrap();
            Response::parse(&buf).unwrap()
        }

        fn announce(&self, cseq: u32) -> Response {
            self.request(
                Request::new("ANNOUNCE", "streamid=video")
                    .with_header("CSeq", cseq)
                    .with_payload(announce_payload()),
            )
        }

        fn addrs(&self) -> StreamAddrs {
            self.controller.lock().session_addrs().unwrap()
        }
    }

    impl Drop for Running {
        fn drop(&mut self) {
            self.shutdown.shutdown();
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    #[test]
    fn test_options_echoes_cseq() {
        let server = Running::start(Config::loopback(), backends());
        let resp = server.request(Request::new("OPTIONS", "rtsp://127.0.0.1").with_header("CSeq", 42));
        assert_eq!(resp.code, 200);
        assert_eq!(resp.header("CSeq"), Some("42"));
    }

    #[test]
    fn test_describe_payload() {
        let server = Running::start(Config::loopback(), backends());
        let resp = server.request(Request::new("DESCRIBE", "rtsp://127.0.0.1").with_header("CSeq", 2));
        assert_eq!(resp.code, 200);
        assert_eq!(resp.payload, "surround-params=NONE");

        let hevc = Running::start(
            Config {
                hevc_enabled: true,
                ..Config::loopback()
            },
            backends(),
        );
        let resp = hevc.request(Request::new("DESCRIBE", "rtsp://127.0.0.1").with_header("CSeq", 2));
        assert_eq!(resp.payload, "sprop-parameter-sets=AAAAAU;surround-params=NONE");
    }

    #[test]
    fn test_setup_targets() {
        let mut controller = Controller::new(Config::loopback(), backends());

        let resp = controller.handle(&Request::new("SETUP", "streamid=audio/0/0").with_header("CSeq", 3));
        assert_eq!(resp.code, 200);
        assert_eq!(resp.header("Session"), Some(AUDIO_SESSION));

        let resp = controller.handle(&Request::new("SETUP", "streamid=video/0/0").with_header("CSeq", 4));
        assert_eq!(resp.code, 200);
        assert_eq!(resp.header("Session"), None);

        let resp = controller.handle(&Request::new("SETUP", "streamid=control/1/0").with_header("CSeq", 5));
        assert_eq!(resp.code, 200);

        let resp = controller.handle(&Request::new("SETUP", "streamid=bogus/0/0").with_header("CSeq", 6));
        assert_eq!(resp.code, 404);
        assert!(!controller.is_active());
    }

    #[test]
    fn test_unknown_command() {
        let mut controller = Controller::new(Config::loopback(), backends());
        let resp = controller.handle(&Request::new("TEARDOWN", "/").with_header("CSeq", 8));
        assert_eq!(resp.code, 404);
        assert_eq!(resp.header("CSeq"), Some("8"));
        assert!(!controller.is_active());
    }

    #[test]
    fn test_unparsable_request_over_tcp() {
        let server = Running::start(Config::loopback(), backends());
        let mut stream = TcpStream::connect(server.addr).unwrap();
        stream.write_all(b"nonsense\r\n\r\n").unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        assert_eq!(Response::parse(&buf).unwrap().code, 404);
        assert!(!server.controller.lock().is_active());
    }

    #[test]
    fn test_bad_announce_is_400() {
        let mut controller = Controller::new(Config::loopback(), backends());
        let payload = announce_payload().replace("a=x-nv-video[0].packetSize:1024 \r\n", "");
        let resp = controller.handle(
            &Request::new("ANNOUNCE", "streamid=video")
                .with_header("CSeq", 1)
                .with_payload(payload),
        );
        assert_eq!(resp.code, 400);
        assert!(!controller.is_active());
    }

    #[test]
    fn test_oversized_packet_size_is_400() {
        let mut controller = Controller::new(Config::loopback(), backends());
        let payload = announce_payload().replace("packetSize:1024", "packetSize:18446744073709551615");
        let resp = controller.handle(
            &Request::new("ANNOUNCE", "streamid=video")
                .with_header("CSeq", 1)
                .with_payload(payload),
        );
        assert_eq!(resp.code, 400);
        assert!(!controller.is_active());
    }

    #[test]
    fn test_announce_streams_shards() {
        let server = Running::start(Config::loopback(), backends());
        assert_eq!(server.announce(1).code, 200);
        let addrs = server.addrs();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        client.send_to(&PING_MAGIC, addrs.video).unwrap();

        // 첫 프레임의 첫 샤드
        let mut buf = [0u8; 2048];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(len, 1024 + 16);
        let header = VideoHeader::parse(&buf[..len]).unwrap();
        assert_eq!(header.frame_index, 1);
        assert_eq!(header.sequence_number, 0);
        assert_ne!(header.flags & FLAG_SOF, 0);
        assert_eq!(header.fec_percentage(), 20);
        assert_eq!(&buf[VIDEO_HEADER_SIZE..VIDEO_HEADER_SIZE + 8], &VIDEO_MAGIC_HEADER);
        // 키프레임 start code 보정
        assert_eq!(
            &buf[VIDEO_HEADER_SIZE + 8..VIDEO_HEADER_SIZE + 13],
            &[0, 0, 0, 1, 0x65]
        );

        // 나머지 샤드: 3000 + 8 bytes → 3 data + 1 parity
        let mut seen = vec![header];
        while seen.len() < 4 {
            let (len, _) = client.recv_from(&mut buf).unwrap();
            seen.push(VideoHeader::parse(&buf[..len]).unwrap());
        }
        assert!(seen.iter().all(|h| h.frame_index == 1));
        assert!(seen.iter().all(|h| h.fec_data_shards() == 3));
        let indices: Vec<usize> = seen.iter().map(|h| h.fec_index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        // 오디오
        let audio = UdpSocket::bind("127.0.0.1:0").unwrap();
        audio.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        audio.send_to(&PING_MAGIC, addrs.audio).unwrap();
        let (len, _) = audio.recv_from(&mut buf).unwrap();
        assert_eq!(buf[1], 97);
        assert_eq!(&buf[2..4], &[0, 1]);
        assert_eq!(len, 12 + 60);
    }

    #[test]
    fn test_second_announce_rejected() {
        let server = Running::start(Config::loopback(), backends());
        assert_eq!(server.announce(1).code, 200);

        let before = server.controller.lock().session().unwrap().thread_ids();
        assert_eq!(before.len(), 3);

        let resp = server.announce(2);
        assert_eq!(resp.code, 503);
        assert_eq!(resp.header("CSeq"), Some("2"));

        let resp = server.request(Request::new("SETUP", "streamid=audio/0/0").with_header("CSeq", 3));
        assert_eq!(resp.code, 503);

        let after = server.controller.lock().session().unwrap().thread_ids();
        assert_eq!(before, after);
    }

    #[test]
    fn test_ping_timeout_then_reannounce() {
        let config = Config {
            ping_timeout: Duration::from_millis(300),
            ping_wait: Duration::from_millis(200),
            control_poll: Duration::from_millis(20),
            accept_poll: Duration::from_millis(10),
            ..Config::loopback()
        };
        let server = Running::start(config, backends());
        assert_eq!(server.announce(1).code, 200);

        // control 트래픽이 없으므로 timeout 후 회수됨
        let start = Instant::now();
        while server.controller.lock().is_active() {
            assert!(start.elapsed() < Duration::from_secs(5), "세션이 회수되지 않음");
            thread::sleep(Duration::from_millis(20));
        }
        assert!(start.elapsed() >= Duration::from_millis(200));

        assert_eq!(server.announce(2).code, 200);
        assert!(server.controller.lock().is_active());
    }

    #[test]
    fn test_control_keeps_session_alive_and_injects_input() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let backends = SessionBackends {
            input: Arc::new(ChannelInput::new(tx)),
            ..backends()
        };
        let config = Config {
            ping_timeout: Duration::from_millis(400),
            control_poll: Duration::from_millis(20),
            accept_poll: Duration::from_millis(10),
            ..Config::loopback()
        };
        let server = Running::start(config, backends);
        let (key, iv) = server.controller.lock().launch_keys();

        assert_eq!(server.announce(1).code, 200);
        let addrs = server.addrs();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut gcm = GcmContext::new(key, iv);

        // timeout보다 오래 유지
        for i in 0..10i16 {
            client
                .send_to(&encode_message(ControlMessageType::StartA, &[]), addrs.control)
                .unwrap();

            let mut plaintext = Vec::new();
            plaintext.extend_from_slice(&PACKET_TYPE_MOUSE_MOVE.to_be_bytes());
            plaintext.extend_from_slice(&[0x06, 0, 0, 0]);
            plaintext.extend_from_slice(&i.to_be_bytes());
            plaintext.extend_from_slice(&(-i).to_be_bytes());
            let input = encode_input(&mut gcm, &plaintext);
            client
                .send_to(&encode_message(ControlMessageType::InputData, &input), addrs.control)
                .unwrap();

            assert_eq!(
                rx.recv_timeout(Duration::from_secs(2)).unwrap(),
                InputEvent::MouseMove { dx: i, dy: -i }
            );
            thread::sleep(Duration::from_millis(80));
        }
        assert!(server.controller.lock().is_active());

        client
            .send_to(&encode_message(ControlMessageType::Termination, &[]), addrs.control)
            .unwrap();
        let start = Instant::now();
        while server.controller.lock().is_active() {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(20));
        }
    }
}
