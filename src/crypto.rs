//! 암호화 모듈 - AES-128-GCM rolling IV + AES-128-ECB
//!
//! 흐름:
//! 1. PIN + salt로 대칭키 유도 (SHA-256 앞 16바이트)
//! 2. 입력 패킷 = ciphertext ‖ tag(16)
//! 3. 16바이트 nonce로 GCM 복호화
//! 4. 처리한 입력의 마지막 16바이트가 다음 IV가 됨

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aes::cipher::{BlockDecrypt, BlockEncrypt};
use aes_gcm::aes::Aes128;
use aes_gcm::{AeadInPlace, AesGcm, KeyInit};
use sha2::{Digest, Sha256};

/// AES-128 키 크기
pub const KEY_SIZE: usize = 16;

/// IV 크기 (GCM nonce로 그대로 사용)
pub const IV_SIZE: usize = 16;

/// GCM 태그 크기
pub const TAG_SIZE: usize = 16;

/// AES 블록 크기
pub const BLOCK_SIZE: usize = 16;

pub type AesKey = [u8; KEY_SIZE];
pub type Iv = [u8; IV_SIZE];

/// 16바이트 nonce를 쓰는 AES-128-GCM
type Aes128Gcm16 = AesGcm<Aes128, U16>;

/// 암호화 오류
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("GCM 태그 불일치")]
    AuthTagMismatch,
    #[error("데이터가 너무 짧음: {0} bytes")]
    TooShort(usize),
    #[error("블록 정렬되지 않은 길이: {0}")]
    InvalidLength(usize),
    #[error("잘못된 PKCS#7 padding")]
    BadPadding,
}

/// SHA-256(salt ‖ pin)의 앞 16바이트
pub fn derive_key(salt: &[u8; 16], pin: &str) -> AesKey {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest[..KEY_SIZE]);
    key
}

/// 처리한 입력 길이가 충분하면 마지막 16바이트로 IV 교체
fn roll_iv(iv: &mut Iv, processed: &[u8]) {
    if processed.len() >= TAG_SIZE + IV_SIZE {
        iv.copy_from_slice(&processed[processed.len() - IV_SIZE..]);
    }
}

/// ciphertext ‖ tag 복호화
///
/// 성공/실패와 무관하게 입력이 32바이트 이상이면 IV가 갱신됨
pub fn decrypt_gcm(key: &AesKey, iv: &mut Iv, tagged: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if tagged.len() < TAG_SIZE {
        return Err(CryptoError::TooShort(tagged.len()));
    }

    let cipher = Aes128Gcm16::new(GenericArray::from_slice(key));
    let (ciphertext, tag) = tagged.split_at(tagged.len() - TAG_SIZE);

    let mut buffer = ciphertext.to_vec();
    let result = cipher.decrypt_in_place_detached(
        GenericArray::from_slice(iv),
        b"",
        &mut buffer,
        GenericArray::from_slice(tag),
    );

    roll_iv(iv, tagged);

    result.map(|_| buffer).map_err(|_| CryptoError::AuthTagMismatch)
}

/// ciphertext ‖ tag 생성 (클라이언트 측), IV 갱신 규칙은 복호화와 동일
pub fn encrypt_gcm(key: &AesKey, iv: &mut Iv, plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes128Gcm16::new(GenericArray::from_slice(key));

    let mut out = Vec::with_capacity(plaintext.len() + TAG_SIZE);
    out.extend_from_slice(plaintext);

    // 버퍼 길이 제한(2^36)을 넘는 입력은 없음
    match cipher.encrypt_in_place_detached(GenericArray::from_slice(iv), b"", &mut out) {
        Ok(tag) => out.extend_from_slice(&tag),
        Err(_) => out.clear(),
    }

    roll_iv(iv, &out);
    out
}

/// control 스레드 전용 GCM 상태 (키 + rolling IV)
pub struct GcmContext {
    key: AesKey,
    iv: Iv,
}

impl GcmContext {
    pub fn new(key: AesKey, iv: Iv) -> Self {
        Self { key, iv }
    }

    /// 현재 IV
    pub fn iv(&self) -> &Iv {
        &self.iv
    }

    pub fn decrypt(&mut self, tagged: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt_gcm(&self.key, &mut self.iv, tagged)
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        encrypt_gcm(&self.key, &mut self.iv, plaintext)
    }
}

impl std::fmt::Debug for GcmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 키는 출력하지 않음
        f.debug_struct("GcmContext")
            .field("iv", &hex::encode(self.iv))
            .finish_non_exhaustive()
    }
}

/// AES-128-ECB (페어링 challenge 등)
pub struct EcbCipher {
    cipher: Aes128,
    /// PKCS#7 padding 사용 여부
    pub padding: bool,
}

impl EcbCipher {
    pub fn new(key: &AesKey, padding: bool) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            padding,
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = plaintext.to_vec();
        if self.padding {
            let pad = BLOCK_SIZE - plaintext.len() % BLOCK_SIZE;
            buffer.resize(plaintext.len() + pad, pad as u8);
        } else if buffer.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::InvalidLength(buffer.len()));
        }

        for block in buffer.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(buffer)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::InvalidLength(ciphertext.len()));
        }

        let mut buffer = ciphertext.to_vec();
        for block in buffer.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }

        if self.padding {
            let pad = *buffer.last().ok_or(CryptoError::BadPadding)? as usize;
            if pad == 0 || pad > BLOCK_SIZE || pad > buffer.len() {
                return Err(CryptoError::BadPadding);
            }
            if !buffer[buffer.len() - pad..].iter().all(|&b| b as usize == pad) {
                return Err(CryptoError::BadPadding);
            }
            buffer.truncate(buffer.len() - pad);
        }
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: AesKey = *b"0123456789abcdef";
    const IV: Iv = [7u8; IV_SIZE];

    #[test]
    fn test_encrypt_decrypt() {
        let plaintext = b"mouse move event payload";

        let mut client_iv = IV;
        let tagged = encrypt_gcm(&KEY, &mut client_iv, plaintext);
        assert_eq!(tagged.len(), plaintext.len() + TAG_SIZE);

        let mut host_iv = IV;
        let decrypted = decrypt_gcm(&KEY, &mut host_iv, &tagged).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext.as_slice());

        // 양측 IV가 같은 값으로 굴러감
        assert_eq!(client_iv, host_iv);
        assert_eq!(&host_iv[..], &tagged[tagged.len() - IV_SIZE..]);
    }

    #[test]
    fn test_sequence_of_packets() {
        let mut client = GcmContext::new(KEY, IV);
        let mut host = GcmContext::new(KEY, IV);

        for i in 0..20u8 {
            let plaintext = vec![i; 8 + i as usize * 3];
            let tagged = client.encrypt(&plaintext);
            assert_eq!(host.decrypt(&tagged).unwrap(), plaintext);
        }
        assert_eq!(client.iv(), host.iv());
    }

    #[test]
    fn test_tag_bit_flip() {
        let mut iv = IV;
        let tagged = encrypt_gcm(&KEY, &mut iv, b"keyboard event 0x41 pressed");
        let tag_start = tagged.len() - TAG_SIZE;

        for bit in 0..TAG_SIZE * 8 {
            let mut flipped = tagged.clone();
            flipped[tag_start + bit / 8] ^= 1 << (bit % 8);

            let mut host_iv = IV;
            assert_eq!(
                decrypt_gcm(&KEY, &mut host_iv, &flipped),
                Err(CryptoError::AuthTagMismatch),
                "tag bit {}",
                bit
            );
        }
    }

    #[test]
    fn test_ciphertext_bit_flip() {
        let mut iv = IV;
        let mut tagged = encrypt_gcm(&KEY, &mut iv, b"scroll event");
        tagged[0] ^= 0x80;

        let mut host_iv = IV;
        assert!(decrypt_gcm(&KEY, &mut host_iv, &tagged).is_err());
    }

    /// 와이어 규약: 복호화 실패 시에도 IV는 입력의 마지막 16바이트로 교체됨
    #[test]
    fn test_iv_rolls_on_failure() {
        let garbage: Vec<u8> = (0..40u8).collect();
        let mut iv = IV;

        assert!(decrypt_gcm(&KEY, &mut iv, &garbage).is_err());
        assert_eq!(&iv[..], &garbage[24..]);
    }

    #[test]
    fn test_iv_kept_for_short_input() {
        let short = [0xAAu8; 20];
        let mut iv = IV;

        assert!(decrypt_gcm(&KEY, &mut iv, &short).is_err());
        assert_eq!(iv, IV);

        assert_eq!(decrypt_gcm(&KEY, &mut iv, &[1, 2, 3]), Err(CryptoError::TooShort(3)));
        assert_eq!(iv, IV);
    }

    #[test]
    fn test_derive_key() {
        let salt = [0x11u8; 16];
        let a = derive_key(&salt, "1234");
        let b = derive_key(&salt, "1234");
        let c = derive_key(&salt, "4321");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(b"1234");
        assert_eq!(&a[..], &hasher.finalize()[..16]);
    }

    #[test]
    fn test_ecb_padding() {
        let ecb = EcbCipher::new(&KEY, true);
        for len in [0usize, 1, 15, 16, 17, 40] {
            let plaintext = vec![0x5Au8; len];
            let encrypted = ecb.encrypt(&plaintext).unwrap();
            assert_eq!(encrypted.len() % BLOCK_SIZE, 0);
            assert!(encrypted.len() > len);
            assert_eq!(ecb.decrypt(&encrypted).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_ecb_without_padding() {
        let ecb = EcbCipher::new(&KEY, false);
        assert_eq!(ecb.encrypt(&[0u8; 15]), Err(CryptoError::InvalidLength(15)));

        let plaintext = [0x33u8; 32];
        let encrypted = ecb.encrypt(&plaintext).unwrap();
        assert_eq!(encrypted.len(), 32);
        // ECB: 같은 블록은 같은 암호문
        assert_eq!(encrypted[..16], encrypted[16..]);
        assert_eq!(ecb.decrypt(&encrypted).unwrap(), plaintext);
    }
}
