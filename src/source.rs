//! 캡처/인코딩 경계
//!
//! 실제 화면/오디오 캡처와 하드웨어 인코더는 이 크레이트 밖에 있음.
//! 채널 스레드는 소스를 별도 캡처 스레드에서 돌리고 큐로 인코딩된 프레임을 받음.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::queue::Queue;
use crate::session::StreamConfig;

/// 인코딩된 비디오 프레임
#[derive(Debug, Clone)]
pub struct VideoPacket {
    /// 1부터 프레임마다 1씩 증가
    pub frame_index: u32,
    pub data: Bytes,
    pub keyframe: bool,
}

/// 인코딩된 오디오 패킷
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub data: Bytes,
}

/// 비디오 캡처 소스
///
/// `capture`는 queue.push가 false를 돌려줄 때까지 블로킹으로 실행됨
pub trait VideoSource: Send + Sync {
    fn capture(&self, config: &StreamConfig, queue: &Queue<VideoPacket>, keyframe_requested: &AtomicBool);
}

/// 오디오 캡처 소스
pub trait AudioSource: Send + Sync {
    fn capture(&self, config: &StreamConfig, queue: &Queue<AudioPacket>);
}

/// 테스트/데모용 비디오 소스: Annex B 형태의 더미 프레임 생성
#[derive(Debug, Clone)]
pub struct SyntheticVideo {
    /// 프레임당 바이트 수 (start code 포함)
    pub frame_size: usize,
    /// None이면 1 / maxFPS
    pub interval: Option<Duration>,
    /// None이면 정지될 때까지 생성
    pub max_frames: Option<u32>,
}

impl Default for SyntheticVideo {
    fn default() -> Self {
        Self {
            frame_size: 4096,
            interval: None,
            max_frames: None,
        }
    }
}

impl SyntheticVideo {
    /// 더미 NAL: IDR(0x65) 또는 non-IDR(0x41) slice
    pub fn frame_bytes(&self, frame_index: u32, keyframe: bool) -> Bytes {
        let size = self.frame_size.max(5);
        let mut buf = BytesMut::with_capacity(size);
        buf.put_slice(&[0x00, 0x00, 0x01]);
        buf.put_u8(if keyframe { 0x65 } else { 0x41 });

        let seed = frame_index.to_le_bytes();
        for i in 0..size - 4 {
            // start code가 다시 나오지 않도록 0을 피함
            buf.put_u8(seed[i % 4] ^ (i as u8) | 0x80);
        }
        buf.freeze()
    }
}

impl VideoSource for SyntheticVideo {
    fn capture(&self, config: &StreamConfig, queue: &Queue<VideoPacket>, keyframe_requested: &AtomicBool) {
        let interval = self
            .interval
            .unwrap_or_else(|| Duration::from_secs(1) / config.framerate.max(1));

        let mut frame_index = 1u32;
        loop {
            if let Some(max) = self.max_frames {
                if frame_index > max {
                    debug!("synthetic video: {}개 프레임 생성 완료", max);
                    return;
                }
            }

            let requested = keyframe_requested.swap(false, Ordering::SeqCst);
            let keyframe = frame_index == 1 || requested;
            let packet = VideoPacket {
                frame_index,
                data: self.frame_bytes(frame_index, keyframe),
                keyframe,
            };

            if !queue.push(packet) {
                return;
            }

            frame_index = frame_index.wrapping_add(1);
            thread::sleep(interval);
        }
    }
}

/// 테스트/데모용 오디오 소스: 고정 크기 무음 패킷
#[derive(Debug, Clone)]
pub struct SilentAudio {
    pub packet_size: usize,
    pub max_packets: Option<u32>,
}

impl Default for SilentAudio {
    fn default() -> Self {
        Self {
            packet_size: 60,
            max_packets: None,
        }
    }
}

impl AudioSource for SilentAudio {
    fn capture(&self, config: &StreamConfig, queue: &Queue<AudioPacket>) {
        let interval = Duration::from_millis(u64::from(config.packet_duration.max(1)));
        let silence = Bytes::from(vec![0u8; self.packet_size]);

        let mut count = 0u32;
        loop {
            if let Some(max) = self.max_packets {
                if count >= max {
                    return;
                }
            }

            if !queue.push(AudioPacket { data: silence.clone() }) {
                return;
            }

            count += 1;
            thread::sleep(interval);
        }
    }
}
