//! 에러 타입 정의

use thiserror::Error;

use crate::crypto::CryptoError;

/// StreamHost 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("잘못된 RTSP 요청: {0}")]
    MalformedRequest(String),

    #[error("ANNOUNCE 필수 속성 누락: {0}")]
    MissingAttribute(String),

    #[error("ANNOUNCE 속성 값 오류: {name}={value}")]
    InvalidAttribute { name: String, value: String },

    #[error("HEVC 비활성화 상태에서 HEVC 요청")]
    HevcDisabled,

    #[error("샤드 수 초과: {shards} > {max}")]
    TooManyShards { shards: usize, max: usize },

    #[error("유효하지 않은 블록 크기: {0}")]
    InvalidBlockSize(usize),

    #[error("FEC 에러: {0:?}")]
    Fec(#[from] reed_solomon_erasure::Error),

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    #[error("잘못된 입력 패킷: {0}")]
    MalformedInput(String),

    #[error("잘못된 control 메시지: type={msg_type:#06x}, {reason}")]
    MalformedControl { msg_type: u16, reason: String },

    #[error("설정 오류: {0}")]
    InvalidConfig(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_keeps_thresholds() {
        let e = Error::TooManyShards { shards: 300, max: 255 };
        let msg = e.to_string();
        assert!(msg.contains("300"));
        assert!(msg.contains("255"));
    }

    #[test]
    fn test_from_crypto() {
        let e: Error = CryptoError::AuthTagMismatch.into();
        assert!(matches!(e, Error::Crypto(CryptoError::AuthTagMismatch)));
    }
}
