//! 비디오/오디오 와이어 포맷
//!
//! 비디오 샤드 = RTP 헤더(12) + 비디오 헤더(16) + payload 조각
//! ```text
//! RTP (big-endian)
//! +--------+--------+-----------------+
//! | 0x90   | type=0 | sequence (u16)  |
//! +--------+--------+-----------------+
//! | timestamp (u32)                   |
//! | ssrc (u32)                        |
//! +-----------------------------------+
//! video (little-endian)
//! | stream_packet_index (u32)         |
//! | frame_index (u32)                 |
//! | flags | rsvd | mfec_flags | mfec_blocks |
//! | fec_info (u32)                    |
//! +-----------------------------------+
//! ```
//! 오디오 = RTP 헤더(12, type=97) + payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::fec::{FecEncoder, ShardSet};
use crate::source::VideoPacket;
use crate::Result;

/// 모든 비디오 payload 앞에 붙는 8바이트
pub const VIDEO_MAGIC_HEADER: [u8; 8] = [0x01, b'7', b'c', b'h', b'a', b'r', b's', b's'];

/// RTP 헤더 크기
pub const RTP_HEADER_SIZE: usize = 12;

/// RTP + 비디오 헤더 크기
pub const VIDEO_HEADER_SIZE: usize = 28;

/// packet_size에 더해지는 RTP 여유분
pub const MAX_RTP_HEADER_SIZE: usize = 16;

/// IPv4 UDP 데이터그램 최대 payload
pub const MAX_UDP_PAYLOAD: usize = 65507;

pub const FLAG_CONTAINS_PIC_DATA: u8 = 0x1;
pub const FLAG_EOF: u8 = 0x2;
pub const FLAG_SOF: u8 = 0x4;

const VIDEO_RTP_HEADER: u8 = 0x90;
const AUDIO_RTP_HEADER: u8 = 0x80;
const AUDIO_PACKET_TYPE: u8 = 97;

/// IDR start code (3바이트 형태)
const IDR_SHORT: &[u8] = &[0x00, 0x00, 0x01, 0x65];
/// IDR start code (4바이트 형태)
const IDR_LONG: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x65];

/// 샤드 하나의 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoHeader {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub stream_packet_index: u32,
    pub frame_index: u32,
    pub flags: u8,
    pub multi_fec_flags: u8,
    pub multi_fec_blocks: u8,
    pub fec_info: u32,
}

impl VideoHeader {
    /// fec_info = index << 12 | data_shards << 22 | percentage << 4
    pub fn fec_info(index: usize, data_shards: usize, percentage: usize) -> u32 {
        ((index << 12) | (data_shards << 22) | (percentage << 4)) as u32
    }

    /// fec_info의 샤드 인덱스
    pub fn fec_index(&self) -> usize {
        ((self.fec_info >> 12) & 0x3FF) as usize
    }

    /// fec_info의 data shard 수
    pub fn fec_data_shards(&self) -> usize {
        (self.fec_info >> 22) as usize
    }

    /// fec_info의 FEC 비율
    pub fn fec_percentage(&self) -> usize {
        ((self.fec_info >> 4) & 0xFF) as usize
    }

    /// buf 앞 28바이트에 기록
    pub fn write(&self, mut buf: &mut [u8]) {
        buf.put_u8(VIDEO_RTP_HEADER);
        buf.put_u8(0);
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        buf.put_u32_le(self.stream_packet_index);
        buf.put_u32_le(self.frame_index);
        buf.put_u8(self.flags);
        buf.put_u8(0);
        buf.put_u8(self.multi_fec_flags);
        buf.put_u8(self.multi_fec_blocks);
        buf.put_u32_le(self.fec_info);
    }

    /// 샤드 앞부분 파싱
    pub fn parse(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < VIDEO_HEADER_SIZE || buf[0] != VIDEO_RTP_HEADER {
            return None;
        }

        buf.advance(2);
        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let stream_packet_index = buf.get_u32_le();
        let frame_index = buf.get_u32_le();
        let flags = buf.get_u8();
        buf.advance(1);
        let multi_fec_flags = buf.get_u8();
        let multi_fec_blocks = buf.get_u8();
        let fec_info = buf.get_u32_le();

        Some(Self {
            sequence_number,
            timestamp,
            ssrc,
            stream_packet_index,
            frame_index,
            flags,
            multi_fec_flags,
            multi_fec_blocks,
            fec_info,
        })
    }
}

/// needle 위치
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// old를 모두 new로 치환
pub fn replace(original: &[u8], old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut replaced = Vec::with_capacity(original.len() + new.len());
    let mut rest = original;

    while let Some(pos) = find(rest, old) {
        replaced.extend_from_slice(&rest[..pos]);
        replaced.extend_from_slice(new);
        rest = &rest[pos + old.len()..];
    }
    replaced.extend_from_slice(rest);
    replaced
}

/// slice_size 조각마다 앞에 header_size 공간을 두고 f로 헤더를 채움
///
/// f(header, index, count)
pub fn insert_headers<F>(header_size: usize, slice_size: usize, data: &[u8], mut f: F) -> Vec<u8>
where
    F: FnMut(&mut [u8], usize, usize),
{
    if data.is_empty() || slice_size == 0 {
        return Vec::new();
    }

    let count = (data.len() + slice_size - 1) / slice_size;
    let mut result = vec![0u8; count * header_size + data.len()];

    for (x, piece) in data.chunks(slice_size).enumerate() {
        let offset = x * (header_size + slice_size);
        f(&mut result[offset..offset + header_size], x, count);
        result[offset + header_size..offset + header_size + piece.len()].copy_from_slice(piece);
    }
    result
}

/// 비디오 프레임 → 헤더 삽입 → FEC 샤드
#[derive(Debug)]
pub struct VideoFramer {
    /// 세션 동안 유지되는 샤드 시퀀스
    lowseq: u32,
    fec: FecEncoder,
    percentage: usize,
    packet_size: usize,
}

impl VideoFramer {
    pub fn new(packet_size: usize, percentage: usize) -> Self {
        Self {
            lowseq: 0,
            fec: FecEncoder::new(),
            percentage,
            packet_size,
        }
    }

    /// packet_size + RTP 여유분
    pub fn blocksize(&self) -> usize {
        self.packet_size + MAX_RTP_HEADER_SIZE
    }

    /// 헤더를 뺀 샤드당 payload
    pub fn payload_blocksize(&self) -> usize {
        self.blocksize().saturating_sub(VIDEO_HEADER_SIZE)
    }

    pub fn lowseq(&self) -> u32 {
        self.lowseq
    }

    /// magic 헤더 + IDR start code 보정
    pub fn prepare_payload(packet: &VideoPacket) -> Vec<u8> {
        let mut payload = Vec::with_capacity(VIDEO_MAGIC_HEADER.len() + packet.data.len() + 8);
        payload.extend_from_slice(&VIDEO_MAGIC_HEADER);
        payload.extend_from_slice(&packet.data);

        if packet.keyframe {
            if find(&payload, IDR_LONG).is_some() {
                warn!(
                    "frame {}: 이미 4바이트 IDR start code 존재, 치환 생략",
                    packet.frame_index
                );
            } else {
                payload = replace(&payload, IDR_SHORT, IDR_LONG);
            }
        }
        payload
    }

    /// 한 프레임을 전송할 샤드로 변환
    pub fn frame(&mut self, packet: &VideoPacket) -> Result<ShardSet> {
        let payload = Self::prepare_payload(packet);
        let blocksize = self.blocksize();
        let payload_blocksize = self.payload_blocksize();
        if payload_blocksize == 0 {
            return Err(crate::Error::InvalidBlockSize(blocksize));
        }

        let lowseq = self.lowseq;
        let percentage = self.percentage;
        let frame_index = packet.frame_index;

        let headered = insert_headers(VIDEO_HEADER_SIZE, payload_blocksize, &payload, |buf, x, count| {
            let mut flags = FLAG_CONTAINS_PIC_DATA;
            if x == 0 {
                flags |= FLAG_SOF;
            }
            if x == count - 1 {
                flags |= FLAG_EOF;
            }

            VideoHeader {
                sequence_number: lowseq.wrapping_add(x as u32) as u16,
                stream_packet_index: lowseq.wrapping_add(x as u32) << 8,
                frame_index,
                flags,
                fec_info: VideoHeader::fec_info(x, count, percentage),
                ..Default::default()
            }
            .write(buf);
        });

        let mut shards = self.fec.encode(&headered, blocksize, percentage)?;

        for x in shards.data_shards..shards.len() {
            VideoHeader {
                sequence_number: lowseq.wrapping_add(x as u32) as u16,
                stream_packet_index: lowseq.wrapping_add(x as u32) << 8,
                frame_index,
                flags: FLAG_CONTAINS_PIC_DATA,
                fec_info: VideoHeader::fec_info(x, shards.data_shards, percentage),
                ..Default::default()
            }
            .write(shards.shard_mut(x));
        }

        self.lowseq = self.lowseq.wrapping_add(shards.len() as u32);
        Ok(shards)
    }
}

/// 오디오 패킷 → RTP 패킷
#[derive(Debug)]
pub struct AudioFramer {
    sequence: u16,
}

impl Default for AudioFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioFramer {
    /// 시퀀스는 1부터
    pub fn new() -> Self {
        Self { sequence: 1 }
    }

    pub fn frame(&mut self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + payload.len());
        buf.put_u8(AUDIO_RTP_HEADER);
        buf.put_u8(AUDIO_PACKET_TYPE);
        buf.put_u16(self.sequence);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_slice(payload);

        self.sequence = self.sequence.wrapping_add(1);
        buf.freeze()
    }

    /// 다음에 쓸 시퀀스 번호
    pub fn sequence(&self) -> u16 {
        self.sequence
    }
}
