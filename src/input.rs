//! 입력 이벤트 디코딩
//!
//! 복호화된 평문의 첫 4바이트는 big-endian 타입 태그.
//! scroll과 keyboard는 같은 태그(0x0A)를 쓰고 다음 바이트로 구분함.

use bytes::Buf;
use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::{Error, Result};

pub const PACKET_TYPE_MOUSE_BUTTON: u32 = 0x05;
pub const PACKET_TYPE_MOUSE_MOVE: u32 = 0x08;
pub const PACKET_TYPE_SCROLL_OR_KEYBOARD: u32 = 0x0A;
pub const PACKET_TYPE_MULTI_CONTROLLER: u32 = 0x1E;

/// scroll 패킷의 5번째 바이트
const SCROLL_MAGIC: u8 = 0x0A;
const MOUSE_BUTTON_RELEASED: u8 = 0x09;
const KEY_RELEASED: u8 = 0x04;

const TYPE_SIZE: usize = 4;
const MOUSE_MOVE_LEN: usize = TYPE_SIZE + 8;
const MOUSE_BUTTON_LEN: usize = TYPE_SIZE + 5;
const SCROLL_LEN: usize = TYPE_SIZE + 6;
const KEYBOARD_LEN: usize = TYPE_SIZE + 8;
const CONTROLLER_LEN: usize = TYPE_SIZE + 22;

/// 게임패드 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerState {
    pub controller_number: i16,
    pub active_mask: u16,
    pub buttons: u16,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub left_stick: (i16, i16),
    pub right_stick: (i16, i16),
}

/// 디코딩된 입력
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    MouseMove { dx: i16, dy: i16 },
    MouseButton { button: i32, released: bool },
    Scroll { amount: i16 },
    Keyboard { key_code: u16, modifiers: u8, released: bool },
    Controller(ControllerState),
}

fn require(buf: &[u8], len: usize, kind: &str) -> Result<()> {
    if buf.len() < len {
        return Err(Error::MalformedInput(format!(
            "{} 패킷 길이 부족: {} < {}",
            kind,
            buf.len(),
            len
        )));
    }
    Ok(())
}

impl InputEvent {
    /// 평문 파싱
    pub fn parse(plaintext: &[u8]) -> Result<Self> {
        require(plaintext, TYPE_SIZE, "input")?;

        let mut buf = plaintext;
        let packet_type = buf.get_u32();

        match packet_type {
            PACKET_TYPE_MOUSE_MOVE => {
                require(plaintext, MOUSE_MOVE_LEN, "mouse move")?;
                buf.advance(4);
                let dx = buf.get_i16();
                let dy = buf.get_i16();
                Ok(Self::MouseMove { dx, dy })
            }
            PACKET_TYPE_MOUSE_BUTTON => {
                require(plaintext, MOUSE_BUTTON_LEN, "mouse button")?;
                let action = buf.get_u8();
                let button = buf.get_i32();
                Ok(Self::MouseButton {
                    button,
                    released: action == MOUSE_BUTTON_RELEASED,
                })
            }
            PACKET_TYPE_SCROLL_OR_KEYBOARD => {
                require(plaintext, TYPE_SIZE + 1, "scroll/keyboard")?;
                if buf[0] == SCROLL_MAGIC {
                    require(plaintext, SCROLL_LEN, "scroll")?;
                    buf.advance(4);
                    Ok(Self::Scroll { amount: buf.get_i16() })
                } else {
                    require(plaintext, KEYBOARD_LEN, "keyboard")?;
                    let action = buf.get_u8();
                    buf.advance(4);
                    let key_code = buf.get_u16_le() & 0x00FF;
                    let modifiers = buf.get_u8();
                    Ok(Self::Keyboard {
                        key_code,
                        modifiers,
                        released: action == KEY_RELEASED,
                    })
                }
            }
            PACKET_TYPE_MULTI_CONTROLLER => {
                require(plaintext, CONTROLLER_LEN, "controller")?;
                buf.advance(4);
                let controller_number = buf.get_i16_le();
                let active_mask = buf.get_u16_le();
                buf.advance(2);
                let buttons = buf.get_u16_le();
                let left_trigger = buf.get_u8();
                let right_trigger = buf.get_u8();
                let left_stick = (buf.get_i16_le(), buf.get_i16_le());
                let right_stick = (buf.get_i16_le(), buf.get_i16_le());
                Ok(Self::Controller(ControllerState {
                    controller_number,
                    active_mask,
                    buttons,
                    left_trigger,
                    right_trigger,
                    left_stick,
                    right_stick,
                }))
            }
            other => Err(Error::MalformedInput(format!("알 수 없는 입력 타입: {:#x}", other))),
        }
    }
}

/// OS 입력 주입 경계
pub trait InputSink: Send + Sync {
    fn inject(&self, event: InputEvent);
}

/// 이벤트를 로그로만 남기는 sink
#[derive(Debug, Default, Clone, Copy)]
pub struct LogInput;

impl InputSink for LogInput {
    fn inject(&self, event: InputEvent) {
        debug!("input: {:?}", event);
    }
}

/// 이벤트를 채널로 넘기는 sink
#[derive(Debug, Clone)]
pub struct ChannelInput {
    tx: Sender<InputEvent>,
}

impl ChannelInput {
    pub fn new(tx: Sender<InputEvent>) -> Self {
        Self { tx }
    }
}

impl InputSink for ChannelInput {
    fn inject(&self, event: InputEvent) {
        if self.tx.send(event).is_err() {
            warn!("input 수신측 종료됨, 이벤트 버림: {:?}", event);
        }
    }
}
