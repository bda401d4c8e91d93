//! Control 채널
//!
//! 메시지 = type(u16 BE) + payload
//!
//! 신뢰성 있는 메시지 전송은 `ControlTransport` 뒤에 숨김.
//! 기본 구현 `UdpControlTransport`는 datagram 하나를 메시지 하나로 취급함.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::crypto::GcmContext;
use crate::input::InputEvent;
use crate::stats::LossReport;
use crate::{Error, Result};

/// 최대 control datagram 크기
const MAX_CONTROL_PACKET: usize = 2048;

/// 입력 payload의 길이 필드 크기
const INPUT_LENGTH_SIZE: usize = 4;

/// Control 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlMessageType {
    StartA = 0x0305,
    StartB = 0x0307,
    InvalidateRefFrames = 0x0301,
    LossStats = 0x0201,
    FrameStats = 0x0204,
    InputData = 0x0206,
    RumbleData = 0x010b,
    Termination = 0x0100,
}

impl ControlMessageType {
    pub const ALL: [ControlMessageType; 8] = [
        Self::StartA,
        Self::StartB,
        Self::InvalidateRefFrames,
        Self::LossStats,
        Self::FrameStats,
        Self::InputData,
        Self::RumbleData,
        Self::Termination,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| *t as u16 == value)
    }
}

/// 전송 계층 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect(SocketAddr),
    Disconnect(SocketAddr),
    Receive { peer: SocketAddr, data: Bytes },
}

/// 신뢰성 있는 control 메시지 전송 경계
pub trait ControlTransport: Send {
    /// 최대 timeout 동안 이벤트 하나를 기다림
    fn service(&mut self, timeout: Duration) -> Result<Option<TransportEvent>>;

    /// 연결된 peer로 메시지 전송
    fn send(&mut self, data: &[u8]) -> Result<()>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

/// UDP datagram 기반 transport
///
/// - 새 주소에서 첫 datagram이 오면 Connect 후 Receive
/// - 빈 datagram은 Disconnect
#[derive(Debug)]
pub struct UdpControlTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    pending: Option<TransportEvent>,
    buf: Vec<u8>,
}

impl UdpControlTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Ok(Self::from_socket(UdpSocket::bind(addr)?))
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            peer: None,
            pending: None,
            buf: vec![0u8; MAX_CONTROL_PACKET],
        }
    }

    /// 현재 peer
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl ControlTransport for UdpControlTransport {
    fn service(&mut self, timeout: Duration) -> Result<Option<TransportEvent>> {
        if let Some(event) = self.pending.take() {
            return Ok(Some(event));
        }

        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let (len, addr) = match self.socket.recv_from(&mut self.buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                ) =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };

        if len == 0 {
            if self.peer == Some(addr) {
                self.peer = None;
                return Ok(Some(TransportEvent::Disconnect(addr)));
            }
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(&self.buf[..len]);
        if self.peer != Some(addr) {
            self.peer = Some(addr);
            self.pending = Some(TransportEvent::Receive { peer: addr, data });
            return Ok(Some(TransportEvent::Connect(addr)));
        }

        Ok(Some(TransportEvent::Receive { peer: addr, data }))
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        match self.peer {
            Some(peer) => {
                self.socket.send_to(data, peer)?;
                Ok(())
            }
            None => {
                debug!("control peer 없음, {} bytes 전송 생략", data.len());
                Ok(())
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// 메시지 핸들러
pub type Handler = Box<dyn FnMut(&[u8]) + Send>;

/// 타입별 핸들러 디스패처
pub struct ControlServer<T: ControlTransport> {
    transport: T,
    handlers: HashMap<u16, Handler>,
}

impl<T: ControlTransport> ControlServer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            handlers: HashMap::new(),
        }
    }

    /// 핸들러 등록
    pub fn map<F>(&mut self, msg_type: ControlMessageType, handler: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.handlers.insert(msg_type as u16, Box::new(handler));
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// 이벤트 하나 처리, 핸들러가 실행된 경우 그 타입을 반환
    pub fn iterate(&mut self, timeout: Duration) -> Result<Option<u16>> {
        match self.transport.service(timeout)? {
            Some(TransportEvent::Receive { data, .. }) => Ok(self.dispatch(&data)),
            Some(TransportEvent::Connect(peer)) => {
                info!("Control client connected: {}", peer);
                Ok(None)
            }
            Some(TransportEvent::Disconnect(peer)) => {
                info!("Control client disconnected: {}", peer);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// 메시지 하나 디스패치
    pub fn dispatch(&mut self, data: &[u8]) -> Option<u16> {
        if data.len() < 2 {
            warn!("control 메시지가 너무 짧음: [{}]", hex::encode(data));
            return None;
        }

        let msg_type = u16::from_be_bytes([data[0], data[1]]);
        let payload = &data[2..];

        match self.handlers.get_mut(&msg_type) {
            Some(handler) => {
                handler(payload);
                Some(msg_type)
            }
            None => {
                warn!(
                    "type [Unknown] {{ {:#06x} }} data: [{}]",
                    msg_type,
                    hex::encode(payload)
                );
                None
            }
        }
    }
}

/// type + payload 메시지 생성
pub fn encode_message(msg_type: ControlMessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u16(msg_type as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// 클라이언트 측: 입력 평문 → input data payload (u32 BE 길이 + ciphertext ‖ tag)
pub fn encode_input(gcm: &mut GcmContext, plaintext: &[u8]) -> Bytes {
    let tagged = gcm.encrypt(plaintext);
    let mut buf = BytesMut::with_capacity(INPUT_LENGTH_SIZE + tagged.len());
    buf.put_u32(tagged.len() as u32);
    buf.put_slice(&tagged);
    buf.freeze()
}

/// input data payload 복호화 + 파싱
///
/// 태그 불일치는 `Error::Crypto`, 길이 필드 오류는 `Error::MalformedControl`,
/// 평문 오류는 `Error::MalformedInput`
pub fn decode_input(gcm: &mut GcmContext, payload: &[u8]) -> Result<InputEvent> {
    let msg_type = ControlMessageType::InputData as u16;
    if payload.len() < INPUT_LENGTH_SIZE {
        return Err(Error::MalformedControl {
            msg_type,
            reason: format!("길이 필드 없음 ({} bytes)", payload.len()),
        });
    }

    let mut buf = payload;
    let length = buf.get_u32() as usize;
    if length > buf.len() {
        return Err(Error::MalformedControl {
            msg_type,
            reason: format!("길이 필드 {} > 남은 데이터 {}", length, buf.len()),
        });
    }

    let plaintext = gcm.decrypt(&buf[..length])?;
    InputEvent::parse(&plaintext)
}

/// 손실 통계 payload: i32 LE 배열 [count, interval_ms, _, last_good_frame]
pub fn parse_loss_stats(payload: &[u8]) -> Result<LossReport> {
    if payload.len() < 16 {
        return Err(Error::MalformedControl {
            msg_type: ControlMessageType::LossStats as u16,
            reason: format!("{} bytes < 16", payload.len()),
        });
    }

    let mut buf = payload;
    let count = buf.get_i32_le();
    let interval_ms = buf.get_i32_le();
    buf.advance(4);
    let last_good_frame = buf.get_i32_le();

    Ok(LossReport {
        count,
        interval_ms,
        last_good_frame,
    })
}

/// 참조 프레임 무효화 payload: i64 LE [first, last]
pub fn parse_invalidate_ref_frames(payload: &[u8]) -> Result<(i64, i64)> {
    if payload.len() < 16 {
        return Err(Error::MalformedControl {
            msg_type: ControlMessageType::InvalidateRefFrames as u16,
            reason: format!("{} bytes < 16", payload.len()),
        });
    }

    let mut buf = payload;
    Ok((buf.get_i64_le(), buf.get_i64_le()))
}
