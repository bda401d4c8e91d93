//! 프레임 재정렬
//!
//! 캡처 스레드가 순서를 어기고 넣은 프레임을 frame_index 순으로 내보냄.
//! 이미 지나간 인덱스와 중복은 버리고, window를 넘게 쌓이면 빈 구간을 건너뜀.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tracing::warn;

use crate::source::VideoPacket;

/// frame_index로만 비교되는 힙 항목
#[derive(Debug)]
struct Pending(VideoPacket);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.frame_index == other.0.frame_index
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.frame_index.cmp(&other.0.frame_index)
    }
}

/// frame_index min-heap
#[derive(Debug)]
pub struct FrameReorder {
    /// 다음에 내보낼 인덱스
    next: u32,
    heap: BinaryHeap<Reverse<Pending>>,
    /// 최대 보관 프레임 수
    window: usize,
    /// 버리거나 건너뛴 프레임 수
    dropped: u64,
}

impl FrameReorder {
    /// 프레임 인덱스는 1부터 시작
    pub fn new(window: usize) -> Self {
        Self::starting_at(1, window)
    }

    pub fn starting_at(next: u32, window: usize) -> Self {
        Self {
            next,
            heap: BinaryHeap::with_capacity(window + 1),
            window: window.max(1),
            dropped: 0,
        }
    }

    /// 프레임 추가
    pub fn push(&mut self, packet: VideoPacket) {
        let idx = packet.frame_index;

        if idx < self.next {
            warn!("이미 지나간 프레임 버림: frame={} next={}", idx, self.next);
            self.dropped += 1;
            return;
        }

        if self.heap.iter().any(|Reverse(p)| p.0.frame_index == idx) {
            warn!("중복 프레임 버림: frame={}", idx);
            self.dropped += 1;
            return;
        }

        self.heap.push(Reverse(Pending(packet)));

        if self.heap.len() > self.window {
            if let Some(Reverse(smallest)) = self.heap.peek() {
                let first = smallest.0.frame_index;
                if first > self.next {
                    warn!(
                        "재정렬 window 초과, 프레임 {}..={} 건너뜀",
                        self.next,
                        first - 1
                    );
                    self.dropped += u64::from(first - self.next);
                    self.next = first;
                }
            }
        }
    }

    /// 순서가 된 프레임 하나
    pub fn pop_ready(&mut self) -> Option<VideoPacket> {
        match self.heap.peek() {
            Some(Reverse(p)) if p.0.frame_index == self.next => {}
            _ => return None,
        }

        let Reverse(Pending(packet)) = self.heap.pop()?;
        self.next = self.next.wrapping_add(1);
        Some(packet)
    }

    /// 다음에 내보낼 인덱스
    pub fn next_index(&self) -> u32 {
        self.next
    }

    /// 대기 중인 프레임 수
    pub fn buffered(&self) -> usize {
        self.heap.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
