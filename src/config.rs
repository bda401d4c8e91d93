//! 호스트 설정

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::{Error, Result, AUDIO_STREAM_PORT, CONTROL_PORT, RTSP_SETUP_PORT, VIDEO_STREAM_PORT};

/// 스트리밍 호스트 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 바인드 IP
    pub bind_ip: IpAddr,

    /// RTSP 포트 (TCP)
    pub rtsp_port: u16,

    /// 비디오 포트 (UDP), 0이면 자동 할당
    pub video_port: u16,

    /// 오디오 포트 (UDP), 0이면 자동 할당
    pub audio_port: u16,

    /// control 포트, 0이면 자동 할당
    pub control_port: u16,

    /// control 트래픽이 없을 때 세션 종료까지의 시간
    pub ping_timeout: Duration,

    /// video/audio 채널이 첫 PING을 기다리는 최대 시간
    pub ping_wait: Duration,

    /// control 루프 poll 주기
    pub control_poll: Duration,

    /// accept 루프 poll 주기
    pub accept_poll: Duration,

    /// FEC 비율 (%), 1 ~ 255
    pub fec_percentage: u8,

    /// 재정렬 힙에 보관할 최대 프레임 수
    pub reorder_window: usize,

    /// 캡처 큐 용량 (패킷 수)
    pub queue_capacity: usize,

    /// HEVC 허용 여부
    pub hevc_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rtsp_port: RTSP_SETUP_PORT,
            video_port: VIDEO_STREAM_PORT,
            audio_port: AUDIO_STREAM_PORT,
            control_port: CONTROL_PORT,
            ping_timeout: Duration::from_secs(10), // 10초
            ping_wait: Duration::from_secs(2),
            control_poll: Duration::from_millis(100),
            accept_poll: Duration::from_millis(50),
            fec_percentage: 20,                    // 20% 패리티
            reorder_window: 16,
            queue_capacity: 64,
            hevc_enabled: false,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 지연 최소화 설정
    pub fn low_latency() -> Self {
        Self {
            ping_timeout: Duration::from_secs(5),
            control_poll: Duration::from_millis(20),
            accept_poll: Duration::from_millis(20),
            fec_percentage: 10,
            reorder_window: 4,
            queue_capacity: 8,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            ping_timeout: Duration::from_secs(20),
            ping_wait: Duration::from_secs(5),
            fec_percentage: 50,                    // 패리티 절반
            reorder_window: 32,
            queue_capacity: 128,
            ..Self::default()
        }
    }

    /// 루프백 + 자동 할당 포트 (테스트용)
    pub fn loopback() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rtsp_port: 0,
            video_port: 0,
            audio_port: 0,
            control_port: 0,
            ..Self::default()
        }
    }

    pub fn rtsp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.rtsp_port)
    }

    pub fn video_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.video_port)
    }

    pub fn audio_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.audio_port)
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.control_port)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.fec_percentage == 0 {
            return Err(Error::InvalidConfig("fec_percentage는 1 이상이어야 함".into()));
        }
        if self.reorder_window == 0 {
            return Err(Error::InvalidConfig("reorder_window는 1 이상이어야 함".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue_capacity는 1 이상이어야 함".into()));
        }
        if self.control_poll.is_zero() || self.accept_poll.is_zero() {
            return Err(Error::InvalidConfig("poll 주기는 0일 수 없음".into()));
        }
        if self.control_poll > self.ping_timeout {
            return Err(Error::InvalidConfig(format!(
                "control_poll({:?})이 ping_timeout({:?})보다 김",
                self.control_poll, self.ping_timeout
            )));
        }
        Ok(())
    }
}
