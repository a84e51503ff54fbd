//! Microphone capture and the capture pipeline.
//!
//! The device side accumulates fixed-size frames and hands them over a
//! channel; the pipeline meters activity, encodes, and forwards to the
//! engine channel. Delivery is fire-and-forget: capture is real-time and a
//! stale frame has no value, so backpressure drops instead of queueing.

use crate::codec::{self, EncodedChunk};
use crate::error::{SessionError, SessionResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Capture-side audio configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000, fixed by the engine's input format)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Frame size in samples (default: 4096, ~256ms at 16kHz)
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_size: 4096,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> SessionResult<()> {
        if self.frame_size == 0 {
            return Err(SessionError::Config("frame_size must be non-zero".to_string()));
        }
        if self.channels != 1 {
            return Err(SessionError::Config(format!(
                "engine input is mono, got {} channels",
                self.channels
            )));
        }
        Ok(())
    }
}

/// One raw frame pulled from the microphone. Ephemeral: consumed immediately
/// into an [`EncodedChunk`].
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Timestamp when captured
    pub captured_at: Instant,
}

/// Keeps the microphone open. Dropping the handle releases the device.
pub trait CaptureHandle {}

/// Seam over microphone acquisition so the session can run against a fake
/// source in tests.
pub trait CaptureBackend: Send + Sync {
    fn open(
        &self,
        config: &AudioConfig,
        frame_tx: mpsc::UnboundedSender<CaptureFrame>,
    ) -> SessionResult<Box<dyn CaptureHandle>>;
}

/// Microphone capture via CPAL.
#[derive(Debug, Default)]
pub struct MicCapture;

struct CpalHandle {
    _stream: Stream,
}

impl CaptureHandle for CpalHandle {}

impl CaptureBackend for MicCapture {
    fn open(
        &self,
        config: &AudioConfig,
        frame_tx: mpsc::UnboundedSender<CaptureFrame>,
    ) -> SessionResult<Box<dyn CaptureHandle>> {
        config.validate()?;

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| SessionError::Device("No input device available".to_string()))?;

        info!(
            device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
            sample_rate = config.sample_rate,
            "acquiring microphone"
        );

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let frame_size = config.frame_size;
        let mut sample_buffer = Vec::with_capacity(frame_size);

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    sample_buffer.push(sample);
                    if sample_buffer.len() >= frame_size {
                        let frame = CaptureFrame {
                            samples: std::mem::replace(
                                &mut sample_buffer,
                                Vec::with_capacity(frame_size),
                            ),
                            captured_at: Instant::now(),
                        };
                        if frame_tx.send(frame).is_err() {
                            // Session is tearing down; the stream will be
                            // dropped shortly.
                            return;
                        }
                    }
                }
            },
            move |err| {
                warn!(error = %err, "capture stream error");
            },
            None,
        )?;

        stream.play()?;
        info!("microphone capture started");

        Ok(Box::new(CpalHandle { _stream: stream }))
    }
}

impl MicCapture {
    /// List available input devices.
    pub fn list_input_devices() -> SessionResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }
        Ok(device_names)
    }
}

/// Run the capture pipeline: for each frame, publish the activity level,
/// encode, and forward to the engine channel without ever blocking.
///
/// Ends when the frame source closes (microphone released) or the engine
/// channel is gone (session over).
pub fn spawn_capture_pipeline(
    config: AudioConfig,
    mut frame_rx: mpsc::UnboundedReceiver<CaptureFrame>,
    chunk_tx: mpsc::Sender<EncodedChunk>,
    level_tx: watch::Sender<f32>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let level = codec::rms_level(&frame.samples);
            let _ = level_tx.send(level);

            let chunk = codec::encode_frame(&frame.samples, config.sample_rate);
            match chunk_tx.try_send(chunk) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("outbound queue full, dropping capture frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("engine channel closed, stopping capture pipeline");
                    break;
                }
            }
        }
        debug!("capture pipeline ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(samples: Vec<f32>) -> CaptureFrame {
        CaptureFrame {
            samples,
            captured_at: Instant::now(),
        }
    }

    #[test]
    fn config_validation() {
        assert!(AudioConfig::default().validate().is_ok());

        let mut config = AudioConfig::default();
        config.frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = AudioConfig::default();
        config.channels = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    #[ignore = "requires an audio host"]
    fn lists_input_devices() {
        let devices = MicCapture::list_input_devices().unwrap();
        println!("input devices: {:?}", devices);
    }

    #[tokio::test]
    async fn pipeline_encodes_and_meters() {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (chunk_tx, mut chunk_rx) = mpsc::channel(8);
        let (level_tx, level_rx) = watch::channel(0.0f32);

        let task = spawn_capture_pipeline(AudioConfig::default(), frame_rx, chunk_tx, level_tx);

        frame_tx.send(frame(vec![0.5; 4096])).unwrap();
        let chunk = tokio::time::timeout(Duration::from_secs(1), chunk_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        assert!(*level_rx.borrow() > 0.5);

        drop(frame_tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn pipeline_drops_on_full_queue() {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (chunk_tx, mut chunk_rx) = mpsc::channel(1);
        let (level_tx, _level_rx) = watch::channel(0.0f32);

        let task = spawn_capture_pipeline(AudioConfig::default(), frame_rx, chunk_tx, level_tx);

        // Nothing consumes the queue: only the first frame fits, the rest drop.
        for _ in 0..3 {
            frame_tx.send(frame(vec![0.1; 4096])).unwrap();
        }
        drop(frame_tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(chunk_rx.recv().await.is_some());
        assert!(chunk_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn pipeline_stops_when_channel_closes() {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (level_tx, _level_rx) = watch::channel(0.0f32);

        let task = spawn_capture_pipeline(AudioConfig::default(), frame_rx, chunk_tx, level_tx);

        drop(chunk_rx);
        frame_tx.send(frame(vec![0.0; 4096])).unwrap();

        // The frame sent after the engine channel closed is dropped and the
        // pipeline terminates even though the frame source is still open.
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
