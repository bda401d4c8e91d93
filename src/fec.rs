//! Reed-Solomon FEC (송신측 전용)
//!
//! - payload를 blocksize 단위 data shard로 자르고 zero padding
//! - parity shard = ceil(data_shards * percentage / 100)
//! - 체계적(systematic) 코딩 행렬: Vandermonde × inv(상단 정방 행렬), GF(2^8) 0x11D
//! - 필드 연산과 코딩 행렬은 `reed-solomon-erasure`의 `galois_8`
//! - 인코딩 엔진은 시작 시 한 번만 선택

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::OnceLock;

use reed_solomon_erasure::galois_8;
use tracing::info;

use crate::{Error, Result};

/// 한 그룹의 최대 샤드 수 (data + parity)
pub const DATA_SHARDS_MAX: usize = 255;

/// parity 인코딩 엔진
pub trait GfBackend: Send + Sync {
    /// 엔진 이름 (로그용)
    fn name(&self) -> &'static str;

    /// 연속 버퍼(total × blocksize)의 data 부분으로 parity 부분을 채움
    fn encode_parity(&self, coder: &galois_8::ReedSolomon, shards: &mut [u8], blocksize: usize) -> Result<()>;
}

/// 전체 data shard를 한 번에 인코딩
pub struct Batch;

impl GfBackend for Batch {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn encode_parity(&self, coder: &galois_8::ReedSolomon, shards: &mut [u8], blocksize: usize) -> Result<()> {
        let mut slices: Vec<&mut [u8]> = shards.chunks_exact_mut(blocksize).collect();
        coder.encode(&mut slices)?;
        Ok(())
    }
}

/// data shard를 하나씩 누적해서 인코딩
///
/// 항상 사용 가능한 폴백
pub struct Incremental;

impl GfBackend for Incremental {
    fn name(&self) -> &'static str {
        "incremental"
    }

    fn encode_parity(&self, coder: &galois_8::ReedSolomon, shards: &mut [u8], blocksize: usize) -> Result<()> {
        let mut slices: Vec<&mut [u8]> = shards.chunks_exact_mut(blocksize).collect();
        for i in 0..coder.data_shard_count() {
            coder.encode_single(i, &mut slices)?;
        }
        Ok(())
    }
}

static BACKEND: OnceLock<&'static dyn GfBackend> = OnceLock::new();

fn detect() -> &'static dyn GfBackend {
    available_backends().into_iter().next().unwrap_or(&Incremental)
}

/// 엔진 선택 (여러 번 호출해도 첫 결과 유지)
pub fn init() -> &'static dyn GfBackend {
    let backend = *BACKEND.get_or_init(detect);
    info!("FEC backend: {}", backend.name());
    backend
}

/// 선택된 엔진 (init 전이면 여기서 선택)
pub fn backend() -> &'static dyn GfBackend {
    *BACKEND.get_or_init(detect)
}

/// 선호 순서대로 사용 가능한 엔진 목록
pub fn available_backends() -> Vec<&'static dyn GfBackend> {
    vec![&Batch, &Incremental]
}

/// (data, parity) 조합의 코더 생성
///
/// parity 0은 코더 없이 data shard만 보내므로 여기서 다루지 않음
pub fn coder(data_shards: usize, parity_shards: usize) -> Result<galois_8::ReedSolomon> {
    let total = data_shards + parity_shards;
    if data_shards == 0 {
        return Err(Error::InvalidConfig("data_shards는 1 이상이어야 함".into()));
    }
    if total > DATA_SHARDS_MAX {
        return Err(Error::TooManyShards {
            shards: total,
            max: DATA_SHARDS_MAX,
        });
    }
    Ok(galois_8::ReedSolomon::new(data_shards, parity_shards)?)
}

/// 한 패킷의 FEC 인코딩 결과
#[derive(Debug, Clone)]
pub struct ShardSet {
    pub data_shards: usize,
    pub parity_shards: usize,
    pub percentage: usize,
    pub blocksize: usize,
    shards: Vec<u8>,
}

impl ShardSet {
    /// 전체 샤드 수 (nr_shards)
    pub fn len(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// i번째 샤드
    pub fn shard(&self, i: usize) -> &[u8] {
        &self.shards[i * self.blocksize..(i + 1) * self.blocksize]
    }

    pub fn shard_mut(&mut self, i: usize) -> &mut [u8] {
        &mut self.shards[i * self.blocksize..(i + 1) * self.blocksize]
    }

    /// 모든 샤드 (data 먼저, 그 다음 parity)
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.shards.chunks_exact(self.blocksize.max(1))
    }

    /// padding 포함 data 영역
    pub fn data(&self) -> &[u8] {
        &self.shards[..self.data_shards * self.blocksize]
    }
}

/// 코딩 행렬을 캐시하는 인코더
#[derive(Debug, Default)]
pub struct FecEncoder {
    cache: HashMap<(usize, usize), galois_8::ReedSolomon>,
}

impl FecEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// payload를 FEC 인코딩
    pub fn encode(&mut self, payload: &[u8], blocksize: usize, percentage: usize) -> Result<ShardSet> {
        if blocksize == 0 {
            return Err(Error::InvalidBlockSize(blocksize));
        }

        let data_shards = (payload.len() + blocksize - 1) / blocksize;
        let parity_shards = (data_shards * percentage + 99) / 100;
        let nr_shards = data_shards + parity_shards;

        if nr_shards > DATA_SHARDS_MAX {
            return Err(Error::TooManyShards {
                shards: nr_shards,
                max: DATA_SHARDS_MAX,
            });
        }

        let mut shards = vec![0u8; nr_shards * blocksize];
        shards[..payload.len()].copy_from_slice(payload);

        if parity_shards > 0 {
            let rs = match self.cache.entry((data_shards, parity_shards)) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(coder(data_shards, parity_shards)?),
            };
            backend().encode_parity(rs, &mut shards, blocksize)?;
        }

        Ok(ShardSet {
            data_shards,
            parity_shards,
            percentage,
            blocksize,
            shards,
        })
    }

    /// 캐시된 코딩 행렬 수
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

/// 캐시 없이 한 번 인코딩
pub fn encode(payload: &[u8], blocksize: usize, percentage: usize) -> Result<ShardSet> {
    FecEncoder::new().encode(payload, blocksize, percentage)
}
