use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::nes::SampleCallback;

/// Bounded FIFO between the emulator thread and the audio callback. When the
/// emulator runs ahead, the oldest samples are dropped.
#[derive(Clone)]
pub struct SampleQueue {
    inner: Arc<Mutex<VecDeque<f32>>>,
    capacity: usize,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, sample: f32) {
        let Ok(mut queue) = self.inner.lock() else {
            return;
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(sample.clamp(-1.0, 1.0));
    }

    pub fn pop(&self) -> f32 {
        self.inner
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct AudioOutput {
    queue: SampleQueue,
    _stream: cpal::Stream,
    sample_rate: u32,
}

impl AudioOutput {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default audio output device"))?;
        let supported = device
            .default_output_config()
            .context("failed to query default audio config")?;

        let stream_config: cpal::StreamConfig = supported.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        // ~96 ms of slack before samples start being dropped.
        let queue = SampleQueue::new(((sample_rate as usize) * 96) / 1000);

        let err_fn = |err| {
            log::error!("audio stream error: {err}");
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                let queue = queue.clone();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _| fill_frames(data, channels, &queue, |s| s),
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::I16 => {
                let queue = queue.clone();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _| {
                        fill_frames(data, channels, &queue, |s| (s * i16::MAX as f32) as i16)
                    },
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::U16 => {
                let queue = queue.clone();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [u16], _| {
                        fill_frames(data, channels, &queue, |s| {
                            ((s * 0.5 + 0.5) * u16::MAX as f32) as u16
                        })
                    },
                    err_fn,
                    None,
                )?
            }
            other => {
                return Err(anyhow!("unsupported audio sample format: {other:?}"));
            }
        };

        stream
            .play()
            .context("failed to start audio output stream")?;
        log::info!("audio output at {sample_rate} Hz, {channels} channel(s)");

        Ok(Self {
            queue,
            _stream: stream,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// A callback suitable for `Nes::set_sample_callback`.
    pub fn sample_callback(&self) -> SampleCallback {
        let queue = self.queue.clone();
        Box::new(move |sample| queue.push(sample))
    }

    pub fn queued_samples(&self) -> usize {
        self.queue.len()
    }
}

fn fill_frames<T: Copy>(
    data: &mut [T],
    channels: usize,
    queue: &SampleQueue,
    convert: impl Fn(f32) -> T,
) {
    for frame in data.chunks_mut(channels.max(1)) {
        let sample = convert(queue.pop());
        frame.fill(sample);
    }
}
