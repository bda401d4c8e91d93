//! 스트리밍 세션
//!
//! - ANNOUNCE payload → `StreamConfig`
//! - 스트림 소켓 바인드 + video / audio / control 스레드 생성
//! - 상태와 ping 기한은 atomic으로 공유 (control 스레드가 쓰고 accept 루프가 읽음)

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel;
use crate::control::{ControlTransport, UdpControlTransport};
use crate::crypto::{AesKey, GcmContext, Iv};
use crate::input::InputSink;
use crate::packet::{MAX_RTP_HEADER_SIZE, MAX_UDP_PAYLOAD, VIDEO_HEADER_SIZE};
use crate::queue::Queue;
use crate::source::{AudioPacket, AudioSource, VideoPacket, VideoSource};
use crate::stats::StreamStats;
use crate::{Config, Error, Result};

/// bitStreamFormat 값: HEVC
pub const BITSTREAM_FORMAT_HEVC: u32 = 1;

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Announced = 1,
    Streaming = 2,
    Terminated = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Announced,
            2 => Self::Streaming,
            3 => Self::Terminated,
            _ => Self::Idle,
        }
    }
}

/// 채널 스레드와 컨트롤러가 공유하는 상태
#[derive(Debug)]
pub struct SessionShared {
    state: AtomicU8,

    /// epoch 기준 ms
    ping_deadline: AtomicU64,
    epoch: Instant,

    /// 다음 프레임을 키프레임으로 요청
    pub keyframe_requested: AtomicBool,

    pub stats: Mutex<StreamStats>,
}

impl Default for SessionShared {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionShared {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            ping_deadline: AtomicU64::new(0),
            epoch: Instant::now(),
            keyframe_requested: AtomicBool::new(false),
            stats: Mutex::new(StreamStats::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Terminated로 전환, 이번 호출이 전환시켰으면 true
    pub fn terminate(&self) -> bool {
        self.state.swap(SessionState::Terminated as u8, Ordering::SeqCst) != SessionState::Terminated as u8
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// ping_deadline = now + timeout
    pub fn refresh_ping(&self, timeout: Duration) {
        let deadline = self.now_ms() + timeout.as_millis() as u64;
        self.ping_deadline.store(deadline, Ordering::SeqCst);
    }

    /// now > ping_deadline
    pub fn ping_expired(&self) -> bool {
        self.now_ms() > self.ping_deadline.load(Ordering::SeqCst)
    }
}

/// ANNOUNCE로 협상된 스트림 설정 (이후 불변)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub client_name: String,

    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate_kbps: u32,
    pub slices_per_frame: u32,
    pub num_ref_frames: u32,
    pub encoder_csc_mode: u32,
    /// 0 = H.264, 1 = HEVC
    pub bitstream_format: u32,
    pub dynamic_range: u32,

    pub audio_channels: u32,
    pub channel_mask: u32,
    /// ms
    pub packet_duration: u32,

    pub packet_size: usize,
    pub fec_percentage: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            client_name: String::new(),
            width: 1280,
            height: 720,
            framerate: 60,
            bitrate_kbps: 10_000,
            slices_per_frame: 1,
            num_ref_frames: 1,
            encoder_csc_mode: 0,
            bitstream_format: 0,
            dynamic_range: 0,
            audio_channels: 2,
            channel_mask: 0x3,
            packet_duration: 5,
            packet_size: 1024,
            fec_percentage: 20,
        }
    }
}

/// SDP 유사 payload의 `a=name:value` 속성
struct Attributes<'a> {
    values: HashMap<&'a str, &'a str>,
}

impl<'a> Attributes<'a> {
    fn get(&self, name: &str) -> Option<&'a str> {
        self.values.get(name).copied()
    }

    fn parse<T: FromStr>(&self, name: &str, value: &str) -> Result<T> {
        value.trim().parse().map_err(|_| Error::InvalidAttribute {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    fn required<T: FromStr>(&self, name: &str) -> Result<T> {
        let value = self
            .get(name)
            .ok_or_else(|| Error::MissingAttribute(name.to_string()))?;
        self.parse(name, value)
    }

    fn optional<T: FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.get(name) {
            Some(value) => self.parse(name, value),
            None => Ok(default),
        }
    }

    /// 여러 이름 중 처음 나오는 값
    fn required_any<T: FromStr>(&self, names: &[&str]) -> Result<T> {
        for name in names {
            if let Some(value) = self.get(name) {
                return self.parse(name, value);
            }
        }
        Err(Error::MissingAttribute(names.join(" | ")))
    }
}

impl StreamConfig {
    /// ANNOUNCE payload 파싱
    pub fn parse_announce(payload: &str, config: &Config) -> Result<Self> {
        let mut client_name = String::new();
        let mut values = HashMap::new();

        for line in payload.split(['\r', '\n']).filter(|l| !l.is_empty()) {
            if let Some(name) = line.strip_prefix("s=") {
                client_name = name.to_string();
            } else if let Some(attr) = line.strip_prefix("a=") {
                let Some((name, value)) = attr.split_once(':') else {
                    debug!("값 없는 속성 무시: {}", attr);
                    continue;
                };
                let value = value.strip_suffix(' ').unwrap_or(value);
                values.insert(name, value);
            }
        }

        let attrs = Attributes { values };

        let stream = Self {
            client_name,
            height: attrs.required("x-nv-video[0].clientViewportHt")?,
            width: attrs.required("x-nv-video[0].clientViewportWd")?,
            framerate: attrs.required("x-nv-video[0].maxFPS")?,
            bitrate_kbps: attrs.required_any(&[
                "x-nv-video[0].initialBitrateKbps",
                "x-nv-vqos[0].bw.maximumBitrateKbps",
            ])?,
            slices_per_frame: attrs.required("x-nv-video[0].videoEncoderSlicesPerFrame")?,
            num_ref_frames: attrs.optional("x-nv-video[0].maxNumReferenceFrames", 1)?,
            encoder_csc_mode: attrs.optional("x-nv-video[0].encoderCscMode", 0)?,
            bitstream_format: attrs.optional("x-nv-vqos[0].bitStreamFormat", 0)?,
            dynamic_range: attrs.optional("x-nv-video[0].dynamicRangeMode", 0)?,
            audio_channels: attrs.required("x-nv-audio.surround.numChannels")?,
            channel_mask: attrs.required("x-nv-audio.surround.channelMask")?,
            packet_duration: attrs.required("x-nv-aqos.packetDuration")?,
            packet_size: attrs.required("x-nv-video[0].packetSize")?,
            fec_percentage: usize::from(config.fec_percentage),
        };

        if stream.bitstream_format == BITSTREAM_FORMAT_HEVC && !config.hevc_enabled {
            return Err(Error::HevcDisabled);
        }

        // shard 하나(RTP 헤더 + packetSize)가 비디오 헤더보다 크고 UDP 데이터그램에 들어가야 함
        if stream.packet_size <= VIDEO_HEADER_SIZE - MAX_RTP_HEADER_SIZE
            || stream.packet_size > MAX_UDP_PAYLOAD - MAX_RTP_HEADER_SIZE
        {
            return Err(Error::InvalidAttribute {
                name: "x-nv-video[0].packetSize".to_string(),
                value: stream.packet_size.to_string(),
            });
        }

        if stream.framerate == 0 {
            return Err(Error::InvalidAttribute {
                name: "x-nv-video[0].maxFPS".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(stream)
    }
}

/// 세션이 사용하는 외부 경계 구현
#[derive(Clone)]
pub struct SessionBackends {
    pub video: Arc<dyn VideoSource>,
    pub audio: Arc<dyn AudioSource>,
    pub input: Arc<dyn InputSink>,
}

/// 세션 스트림 소켓의 로컬 주소
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAddrs {
    pub video: SocketAddr,
    pub audio: SocketAddr,
    pub control: SocketAddr,
}

/// 활성 세션
pub struct Session {
    pub stream: StreamConfig,
    shared: Arc<SessionShared>,
    video_queue: Arc<Queue<VideoPacket>>,
    audio_queue: Arc<Queue<AudioPacket>>,
    addrs: StreamAddrs,
    threads: Vec<JoinHandle<()>>,
}

impl Session {
    /// 소켓 바인드 후 세 채널 스레드 시작
    pub fn start(
        config: &Config,
        stream: StreamConfig,
        key: AesKey,
        iv: Iv,
        backends: &SessionBackends,
    ) -> Result<Self> {
        let video_socket = UdpSocket::bind(config.video_addr())?;
        let audio_socket = UdpSocket::bind(config.audio_addr())?;
        let control = UdpControlTransport::bind(config.control_addr())?;

        let addrs = StreamAddrs {
            video: video_socket.local_addr()?,
            audio: audio_socket.local_addr()?,
            control: control.local_addr()?,
        };

        let shared = Arc::new(SessionShared::new());
        shared.refresh_ping(config.ping_timeout);
        shared.set_state(SessionState::Announced);

        let video_queue = Arc::new(Queue::bounded(config.queue_capacity));
        let audio_queue = Arc::new(Queue::bounded(config.queue_capacity));

        let mut session = Self {
            stream,
            shared,
            video_queue,
            audio_queue,
            addrs,
            threads: Vec::with_capacity(3),
        };

        if let Err(e) = session.spawn(config, video_socket, audio_socket, control, key, iv, backends) {
            session.stop();
            return Err(e);
        }

        session.shared.set_state(SessionState::Streaming);
        info!(
            "세션 시작: client={:?} {}x{}@{} packet_size={} fec={}% video={} audio={} control={}",
            session.stream.client_name,
            session.stream.width,
            session.stream.height,
            session.stream.framerate,
            session.stream.packet_size,
            session.stream.fec_percentage,
            addrs.video,
            addrs.audio,
            addrs.control
        );
        Ok(session)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        &mut self,
        config: &Config,
        video_socket: UdpSocket,
        audio_socket: UdpSocket,
        control: UdpControlTransport,
        key: AesKey,
        iv: Iv,
        backends: &SessionBackends,
    ) -> Result<()> {
        let video = {
            let config = config.clone();
            let stream = self.stream.clone();
            let shared = self.shared.clone();
            let queue = self.video_queue.clone();
            let source = backends.video.clone();
            thread::Builder::new()
                .name("video".into())
                .spawn(move || channel::video_thread(video_socket, shared, queue, source, stream, config))?
        };
        self.threads.push(video);

        let audio = {
            let config = config.clone();
            let stream = self.stream.clone();
            let shared = self.shared.clone();
            let queue = self.audio_queue.clone();
            let source = backends.audio.clone();
            thread::Builder::new()
                .name("audio".into())
                .spawn(move || channel::audio_thread(audio_socket, shared, queue, source, stream, config))?
        };
        self.threads.push(audio);

        let control_thread = {
            let config = config.clone();
            let shared = self.shared.clone();
            let sink = backends.input.clone();
            // 키와 IV는 control 스레드가 독점
            let gcm = GcmContext::new(key, iv);
            thread::Builder::new()
                .name("control".into())
                .spawn(move || channel::control_thread(control, shared, gcm, sink, config))?
        };
        self.threads.push(control_thread);

        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn addrs(&self) -> StreamAddrs {
        self.addrs
    }

    /// 채널 스레드 ID (video, audio, control 순)
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.iter().map(|t| t.thread().id()).collect()
    }

    /// Terminated 설정, 큐 정지, 모든 스레드 join
    pub fn stop(&mut self) {
        self.shared.terminate();
        self.video_queue.stop();
        self.audio_queue.stop();

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("channel").to_string();
            if handle.join().is_err() {
                warn!("{} 스레드 panic", name);
            }
        }

        info!("세션 종료: {}", self.shared.stats.lock().summary());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}
