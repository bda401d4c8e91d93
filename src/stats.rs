//! 세션 전송 통계

use std::time::{Duration, Instant};

/// 클라이언트가 보고한 손실 통계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LossReport {
    /// 구간 내 손실 패킷 수
    pub count: i32,
    /// 보고 구간 (ms)
    pub interval_ms: i32,
    /// 마지막으로 정상 수신된 프레임
    pub last_good_frame: i32,
}

/// 세션 통계
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 전송한 비디오 프레임 수
    pub frames: u64,

    /// 전송한 샤드 수 (data + parity)
    pub shards: u64,

    /// 그중 parity 샤드 수
    pub parity_shards: u64,

    /// 비디오 전송 바이트
    pub video_bytes: u64,

    /// 전송한 오디오 패킷 수
    pub audio_packets: u64,

    /// 오디오 전송 바이트
    pub audio_bytes: u64,

    /// 손실 보고 횟수
    pub loss_reports: u64,

    /// 보고된 손실 패킷 합계
    pub reported_loss: u64,

    /// 마지막 손실 보고
    pub last_loss: Option<LossReport>,

    /// 주입한 입력 이벤트 수
    pub input_events: u64,

    /// 버리거나 건너뛴 프레임 수
    pub dropped_frames: u64,

    /// 키프레임 요청 수
    pub keyframe_requests: u64,
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            frames: 0,
            shards: 0,
            parity_shards: 0,
            video_bytes: 0,
            audio_packets: 0,
            audio_bytes: 0,
            loss_reports: 0,
            reported_loss: 0,
            last_loss: None,
            input_events: 0,
            dropped_frames: 0,
            keyframe_requests: 0,
        }
    }

    /// 프레임 하나 전송 기록
    pub fn record_frame(&mut self, shards: usize, parity: usize, bytes: usize) {
        self.frames += 1;
        self.shards += shards as u64;
        self.parity_shards += parity as u64;
        self.video_bytes += bytes as u64;
    }

    pub fn record_audio(&mut self, bytes: usize) {
        self.audio_packets += 1;
        self.audio_bytes += bytes as u64;
    }

    pub fn record_loss(&mut self, report: LossReport) {
        self.loss_reports += 1;
        self.reported_loss += report.count.max(0) as u64;
        self.last_loss = Some(report);
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 비디오 처리율 (bytes/sec)
    pub fn video_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.video_bytes as f64 / elapsed
    }

    /// 전체 샤드 중 parity 비율
    pub fn parity_ratio(&self) -> f64 {
        if self.shards == 0 {
            return 0.0;
        }
        self.parity_shards as f64 / self.shards as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Frames: {} | Shards: {} (parity {:.1}%) | Video: {:.2} MB/s | Audio: {} pkts | Loss reports: {} ({} lost) | Input: {} | Dropped: {}",
            self.elapsed().as_secs_f64(),
            self.frames,
            self.shards,
            self.parity_ratio() * 100.0,
            self.video_throughput() / 1_000_000.0,
            self.audio_packets,
            self.loss_reports,
            self.reported_loss,
            self.input_events,
            self.dropped_frames,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_frame() {
        let mut stats = StreamStats::new();
        stats.record_frame(6, 2, 6 * 1040);
        stats.record_frame(4, 1, 4 * 1040);

        assert_eq!(stats.frames, 2);
        assert_eq!(stats.shards, 10);
        assert!((stats.parity_ratio() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_record_loss() {
        let mut stats = StreamStats::new();
        stats.record_loss(LossReport {
            count: 3,
            interval_ms: 50,
            last_good_frame: 10,
        });
        stats.record_loss(LossReport {
            count: -1,
            interval_ms: 50,
            last_good_frame: 11,
        });

        assert_eq!(stats.loss_reports, 2);
        assert_eq!(stats.reported_loss, 3);
        assert_eq!(stats.last_loss.map(|l| l.last_good_frame), Some(11));
    }

    #[test]
    fn test_summary() {
        let mut stats = StreamStats::default();
        stats.record_audio(60);
        let summary = stats.summary();
        assert!(summary.contains("Frames: 0"));
        assert!(summary.contains("Audio: 1 pkts"));
    }
}
