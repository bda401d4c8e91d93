//! 캡처 스레드 → 채널 스레드 bounded 큐
//!
//! - push: 가득 차면 대기, 정지 후에는 false
//! - pop: 비어 있으면 대기, 정지 후에는 None (sentinel)
//! - stop: 여러 번 호출해도 안전

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;

/// 정지 가능한 bounded 큐
pub struct Queue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,

    /// drop되면 stop_rx가 깨어남
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,

    stopped: AtomicBool,
}

impl<T> Queue<T> {
    /// 용량 capacity의 큐 생성
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        let (stop_tx, stop_rx) = bounded(0);

        Self {
            tx,
            rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            stopped: AtomicBool::new(false),
        }
    }

    /// 항목 추가, 큐가 정지되면 false
    pub fn push(&self, item: T) -> bool {
        if self.is_stopped() {
            return false;
        }

        select! {
            send(self.tx, item) -> res => res.is_ok(),
            recv(self.stop_rx) -> _ => false,
        }
    }

    /// 항목 꺼내기, 큐가 정지되면 None
    pub fn pop(&self) -> Option<T> {
        if self.is_stopped() {
            return None;
        }

        select! {
            recv(self.rx) -> item => item.ok(),
            recv(self.stop_rx) -> _ => None,
        }
    }

    /// 대기 없이 꺼내기
    pub fn try_pop(&self) -> Option<T> {
        if self.is_stopped() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// 큐 정지, 대기 중인 push/pop이 모두 깨어남
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_tx.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// 대기 중인 항목 수
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = Queue::bounded(4);
        for i in 0..4 {
            assert!(queue.push(i));
        }
        assert_eq!(queue.len(), 4);
        for i in 0..4 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stop_wakes_pop() {
        let queue: Arc<Queue<u32>> = Arc::new(Queue::bounded(4));
        let q = queue.clone();
        let handle = thread::spawn(move || q.pop());

        thread::sleep(Duration::from_millis(50));
        queue.stop();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn test_stop_wakes_full_push() {
        let queue = Arc::new(Queue::bounded(1));
        assert!(queue.push(1u32));

        let q = queue.clone();
        let handle = thread::spawn(move || q.push(2));

        thread::sleep(Duration::from_millis(50));
        queue.stop();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let queue = Queue::bounded(2);
        assert!(queue.push(1u8));
        queue.stop();
        queue.stop();
        assert!(queue.is_stopped());
        assert!(!queue.push(2));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_producer_consumer() {
        let queue = Arc::new(Queue::bounded(8));
        let q = queue.clone();
        let producer = thread::spawn(move || {
            for i in 0..1000u32 {
                if !q.push(i) {
                    break;
                }
            }
        });

        let mut expected = 0;
        while expected < 1000 {
            assert_eq!(queue.pop(), Some(expected));
            expected += 1;
        }
        producer.join().unwrap();
    }
}
