//! Receive-side audio jitter buffer
//!
//! A bounded FIFO between the network receive path (producer) and the audio
//! output path (consumer, pulling at the hardware rate). Both sides are
//! non-blocking: on overflow the oldest block is evicted, on starvation the
//! consumer simply gets nothing.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Block of 16-bit little-endian PCM samples from one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlock {
    pub sender: String,
    pub samples: Bytes,
}

impl AudioBlock {
    pub fn new(sender: impl Into<String>, samples: impl Into<Bytes>) -> Self {
        Self {
            sender: sender.into(),
            samples: samples.into(),
        }
    }

    /// Number of whole samples in the block
    pub fn sample_count(&self) -> usize {
        self.samples.len() / 2
    }

    /// Convert to normalized f32 samples for output devices
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
            .collect()
    }
}

/// Bounded drop-oldest FIFO of audio blocks
pub struct JitterBuffer {
    queue: ArrayQueue<AudioBlock>,
    received: AtomicUsize,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl JitterBuffer {
    /// Create a buffer holding at most `depth` blocks
    pub fn new(depth: usize) -> Self {
        Self {
            queue: ArrayQueue::new(depth.max(1)),
            received: AtomicUsize::new(0),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push a block, evicting the oldest one if the buffer is full.
    ///
    /// Returns false if a block was evicted.
    pub fn push(&self, block: AudioBlock) -> bool {
        self.received.fetch_add(1, Ordering::Relaxed);
        match self.queue.force_push(block) {
            None => true,
            Some(_evicted) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop the oldest block, counting an underrun if there is none
    pub fn pop(&self) -> Option<AudioBlock> {
        let block = self.queue.pop();
        if block.is_none() {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        block
    }

    /// Pop without counting underrun
    pub fn try_pop(&self) -> Option<AudioBlock> {
        self.queue.pop()
    }

    /// Discard everything buffered
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            level: self.len(),
            capacity: self.capacity(),
            received: self.received.load(Ordering::Relaxed),
            overflows: self.overflow_count.load(Ordering::Relaxed),
            underruns: self.underrun_count.load(Ordering::Relaxed),
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterStats {
    pub level: usize,
    pub capacity: usize,
    pub received: usize,
    pub overflows: usize,
    pub underruns: usize,
}

impl JitterStats {
    /// Share of received blocks evicted before playback
    pub fn drop_rate(&self) -> f32 {
        if self.received == 0 {
            0.0
        } else {
            self.overflows as f32 / self.received as f32
        }
    }
}

/// Thread-safe handle to a jitter buffer
pub type SharedJitterBuffer = Arc<JitterBuffer>;

/// Create a new shared jitter buffer
pub fn create_shared_jitter(depth: usize) -> SharedJitterBuffer {
    Arc::new(JitterBuffer::new(depth))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: u8) -> AudioBlock {
        AudioBlock::new("ana", vec![n, 0])
    }

    #[test]
    fn test_fifo_order() {
        let jitter = JitterBuffer::new(5);
        for n in 0..3 {
            assert!(jitter.push(block(n)));
        }

        assert_eq!(jitter.pop().unwrap().samples[0], 0);
        assert_eq!(jitter.pop().unwrap().samples[0], 1);
        assert_eq!(jitter.pop().unwrap().samples[0], 2);
        assert!(jitter.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let jitter = JitterBuffer::new(5);
        for n in 0..5 {
            assert!(jitter.push(block(n)));
        }
        assert!(!jitter.push(block(5)));
        assert!(!jitter.push(block(6)));

        assert_eq!(jitter.len(), 5);
        let order: Vec<u8> = std::iter::from_fn(|| jitter.try_pop()).map(|b| b.samples[0]).collect();
        assert_eq!(order, vec![2, 3, 4, 5, 6]);

        let stats = jitter.stats();
        assert_eq!(stats.overflows, 2);
        assert_eq!(stats.received, 7);
    }

    #[test]
    fn test_starvation_is_counted_not_blocking() {
        let jitter = JitterBuffer::new(2);
        assert!(jitter.pop().is_none());
        assert!(jitter.pop().is_none());
        assert!(jitter.try_pop().is_none());
        assert_eq!(jitter.stats().underruns, 2);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let jitter = create_shared_jitter(5);
        let producer = {
            let jitter = jitter.clone();
            std::thread::spawn(move || {
                for n in 0..200u8 {
                    jitter.push(block(n));
                }
            })
        };

        let mut last = None;
        let mut popped = 0;
        while popped < 50 {
            if let Some(b) = jitter.try_pop() {
                let n = b.samples[0];
                if let Some(prev) = last {
                    assert!(n > prev, "FIFO order violated: {} after {}", n, prev);
                }
                last = Some(n);
                popped += 1;
            } else if producer.is_finished() && jitter.is_empty() {
                break;
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_pcm_conversion() {
        let samples: Vec<u8> = [0i16, i16::MAX, -i16::MAX]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let block = AudioBlock::new("ana", samples);

        assert_eq!(block.sample_count(), 3);
        assert_eq!(block.to_f32(), vec![0.0, 1.0, -1.0]);
    }
}
