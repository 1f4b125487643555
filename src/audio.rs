use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Consumer of rendered sample blocks. Samples are signed 16-bit, interleaved
/// by channel. Implementations must not block the emulation thread.
pub trait AudioSink {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    fn reconfigure(&mut self, sample_rate: u32, channels: u16);

    /// Free space the producer may fill before calling [`AudioSink::end_write`].
    fn begin_write(&mut self) -> &mut [i16];

    /// Commits the first `count` samples written into the last `begin_write` slice.
    fn end_write(&mut self, count: usize);
}

/// Sink that discards everything.
#[derive(Debug, Clone)]
pub struct NullAudioSink {
    sample_rate: u32,
    channels: u16,
    scratch: Vec<i16>,
}

impl NullAudioSink {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            scratch: vec![0; 4096],
        }
    }
}

impl AudioSink for NullAudioSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn reconfigure(&mut self, sample_rate: u32, channels: u16) {
        self.sample_rate = sample_rate;
        self.channels = channels;
    }

    fn begin_write(&mut self) -> &mut [i16] {
        &mut self.scratch
    }

    fn end_write(&mut self, _count: usize) {}
}

/// Shared handle for draining a [`RingAudioSink`] from another thread.
#[derive(Debug, Clone)]
pub struct AudioQueue {
    queue: Arc<Mutex<VecDeque<i16>>>,
}

impl AudioQueue {
    pub fn pop_into(&self, out: &mut [i16]) -> usize {
        let Ok(mut queue) = self.queue.lock() else {
            return 0;
        };
        let count = out.len().min(queue.len());
        for (dst, src) in out.iter_mut().zip(queue.drain(..count)) {
            *dst = src;
        }
        count
    }

    pub fn queued_samples(&self) -> usize {
        if let Ok(queue) = self.queue.lock() {
            queue.len()
        } else {
            0
        }
    }
}

/// Bounded FIFO of interleaved samples. When the consumer falls behind, the
/// oldest samples are dropped so the producer never waits.
#[derive(Debug)]
pub struct RingAudioSink {
    queue: Arc<Mutex<VecDeque<i16>>>,
    staging: Vec<i16>,
    sample_rate: u32,
    channels: u16,
    max_queue_samples: usize,
}

impl RingAudioSink {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let max_queue_samples = Self::queue_limit(sample_rate, channels);
        Self {
            queue: Arc::new(Mutex::new(VecDeque::with_capacity(max_queue_samples))),
            staging: vec![0; max_queue_samples],
            sample_rate,
            channels,
            max_queue_samples,
        }
    }

    // Roughly 96 ms of audio.
    fn queue_limit(sample_rate: u32, channels: u16) -> usize {
        ((sample_rate as usize * 96) / 1000).max(1) * channels.max(1) as usize
    }

    pub fn queue(&self) -> AudioQueue {
        AudioQueue {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl AudioSink for RingAudioSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn reconfigure(&mut self, sample_rate: u32, channels: u16) {
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.max_queue_samples = Self::queue_limit(sample_rate, channels);
        self.staging = vec![0; self.max_queue_samples];
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    fn begin_write(&mut self) -> &mut [i16] {
        &mut self.staging
    }

    fn end_write(&mut self, count: usize) {
        let count = count.min(self.staging.len());
        if count == 0 {
            return;
        }

        let Ok(mut queue) = self.queue.lock() else {
            return;
        };

        let future_len = queue.len().saturating_add(count);
        if future_len > self.max_queue_samples {
            let drop_count = future_len - self.max_queue_samples;
            let excess = drop_count.min(queue.len());
            queue.drain(..excess);
        }
        queue.extend(self.staging[..count].iter().copied());
    }
}
