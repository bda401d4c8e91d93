//! # StreamHost
//!
//! 게임 스트리밍 호스트의 세션 코어
//!
//! ## 핵심 특징
//! - **RTSP 유사 협상**: OPTIONS / DESCRIBE / SETUP / ANNOUNCE / PLAY
//! - **단일 세션**: 동시에 하나의 클라이언트만 스트리밍
//! - **FEC 비디오**: Reed-Solomon 패리티 샤드로 손실 복구
//! - **오디오**: 시퀀스 번호만 붙인 raw 패킷
//! - **암호화 입력**: AES-128-GCM + rolling IV
//! - **채널 스레드**: video / audio / control 각각 독립 OS 스레드
//! - **생존 확인**: control 트래픽 기반 ping timeout

pub mod channel;
pub mod config;
pub mod control;
pub mod crypto;
pub mod error;
pub mod fec;
pub mod input;
pub mod packet;
pub mod queue;
pub mod reorder;
pub mod rtsp;
pub mod server;
pub mod session;
pub mod source;
pub mod stats;

pub use config::Config;
pub use control::{ControlMessageType, ControlTransport, TransportEvent, UdpControlTransport};
pub use crypto::{derive_key, decrypt_gcm, encrypt_gcm, AesKey, CryptoError, EcbCipher, GcmContext, Iv};
pub use error::{Error, Result};
pub use fec::{FecEncoder, ShardSet};
pub use input::{InputEvent, InputSink, LogInput};
pub use packet::{AudioFramer, VideoFramer, VideoHeader};
pub use queue::Queue;
pub use reorder::FrameReorder;
pub use server::{Controller, Server, ShutdownHandle};
pub use session::{Session, SessionState, StreamConfig};
pub use source::{AudioPacket, AudioSource, SilentAudio, SyntheticVideo, VideoPacket, VideoSource};
pub use stats::StreamStats;

/// RTSP 프로토콜 문자열
pub const RTSP_PROTOCOL: &str = "RTSP/1.0";

/// 기본 RTSP 포트 (TCP)
pub const RTSP_SETUP_PORT: u16 = 48010;

/// 기본 비디오 스트림 포트 (UDP)
pub const VIDEO_STREAM_PORT: u16 = 47998;

/// 기본 control 포트
pub const CONTROL_PORT: u16 = 47999;

/// 기본 오디오 스트림 포트 (UDP)
pub const AUDIO_STREAM_PORT: u16 = 48000;

/// 클라이언트가 처음 보내는 ping ("PING")
pub const PING_MAGIC: [u8; 4] = [0x50, 0x49, 0x4E, 0x47];
