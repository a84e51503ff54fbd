//! Playback scheduler: gapless, strictly ordered output with barge-in flush.
//!
//! Owns the timeline cursor (`next_start`) and the active output set. Every
//! mutation happens on one dedicated thread consuming commands in arrival
//! order — the single serialization point reconciling the network receive
//! task with the output device. The thread also owns the output sink, which
//! is `!Send` on some platforms (same constraint the capture stream has).

use crate::codec;
use crate::error::{SessionError, SessionResult};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How often the scheduler checks the output clock for finished buffers.
const FINISH_POLL: Duration = Duration::from_millis(20);

/// Monotonic output-device time source, in seconds.
pub trait OutputClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall-clock output time since session start.
#[derive(Debug)]
pub struct SessionClock {
    origin: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputClock for SessionClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock for exercising the scheduler without real time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, now: f64) {
        *self.now.lock().expect("clock lock poisoned") = now;
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock().expect("clock lock poisoned") += secs;
    }
}

impl OutputClock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().expect("clock lock poisoned")
    }
}

/// Output sink. Lives on the scheduler thread; not required to be `Send`.
pub trait AudioOut {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> SessionResult<()>;
    /// Stop everything queued or playing, immediately.
    fn stop_all(&mut self);
}

/// Builds the sink on the scheduler thread itself, since the production sink
/// cannot cross threads.
pub type OutFactory = Box<dyn FnOnce() -> SessionResult<Box<dyn AudioOut>> + Send>;

/// Production output via a rodio sink. Appended buffers play back-to-back,
/// which matches the gapless timeline the core tracks.
pub struct RodioOut {
    _stream: rodio::OutputStream,
    _handle: rodio::OutputStreamHandle,
    sink: rodio::Sink,
}

impl RodioOut {
    pub fn new() -> SessionResult<Self> {
        let (stream, handle) = rodio::OutputStream::try_default()
            .map_err(|e| SessionError::Device(e.to_string()))?;
        let sink =
            rodio::Sink::try_new(&handle).map_err(|e| SessionError::Device(e.to_string()))?;
        info!("output sink ready");
        Ok(Self {
            _stream: stream,
            _handle: handle,
            sink,
        })
    }
}

impl AudioOut for RodioOut {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> SessionResult<()> {
        let source = rodio::buffer::SamplesBuffer::new(1, sample_rate, samples.to_vec());
        self.sink.append(source);
        Ok(())
    }

    fn stop_all(&mut self) {
        self.sink.stop();
    }
}

/// Discards audio. Placeholder sink for tests and headless runs.
#[derive(Debug, Default)]
pub struct NullOut;

impl AudioOut for NullOut {
    fn play(&mut self, _samples: &[f32], _sample_rate: u32) -> SessionResult<()> {
        Ok(())
    }

    fn stop_all(&mut self) {}
}

/// Speaking-state transitions observed by the session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// First buffer admitted into an otherwise idle window.
    SpeakingStarted,
    /// The active set drained naturally (not via interrupt or flush).
    SpeakingStopped,
    /// The active set was discarded by a barge-in. Not a conversational
    /// "stopped speaking" — it only settles the speaking flag.
    SpeakingInterrupted,
}

#[derive(Debug, Clone, Copy)]
struct ActiveBuffer {
    start: f64,
    end: f64,
}

/// The timeline state machine. Single-threaded by construction; the
/// scheduler thread is its only caller.
#[derive(Debug)]
pub struct SchedulerCore {
    next_start: f64,
    active: Vec<ActiveBuffer>,
    speaking: bool,
}

impl SchedulerCore {
    pub fn new(now: f64) -> Self {
        Self {
            next_start: now,
            active: Vec::new(),
            speaking: false,
        }
    }

    /// Admit a buffer of `duration` seconds. Returns its scheduled start and
    /// whether this began a new speaking window.
    ///
    /// Gapless rule: start at `max(next_start, now)` — never in the past,
    /// never leaving an avoidable gap behind already-queued audio.
    pub fn admit(&mut self, duration: f64, now: f64) -> (f64, bool) {
        let start = if self.next_start > now {
            self.next_start
        } else {
            now
        };
        self.next_start = start + duration;
        self.active.push(ActiveBuffer {
            start,
            end: start + duration,
        });
        let started = !self.speaking;
        self.speaking = true;
        (start, started)
    }

    /// Drop buffers whose output has finished by `now`. Returns true when
    /// the active set just drained naturally (speaking stopped).
    pub fn reap_finished(&mut self, now: f64) -> bool {
        if self.active.is_empty() {
            return false;
        }
        self.active.retain(|b| b.end > now);
        if self.active.is_empty() && self.speaking {
            self.speaking = false;
            return true;
        }
        false
    }

    /// Barge-in: discard the whole active set as a unit and reset the cursor
    /// to the current output time (not zero), so the next admitted buffer
    /// schedules immediately instead of after a stale offset.
    ///
    /// Emits nothing: a turn killed mid-flight is not "stopped speaking
    /// naturally".
    pub fn interrupt(&mut self, now: f64) {
        self.active.clear();
        self.next_start = now;
        self.speaking = false;
    }

    /// Teardown clearing. Identical to [`interrupt`](Self::interrupt) —
    /// the distinction (no conversational events) lives in the caller.
    pub fn flush(&mut self, now: f64) {
        self.interrupt(now);
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }
}

enum SchedulerCommand {
    Audio(Vec<u8>),
    Interrupt,
    Flush,
    Shutdown,
}

/// Cloneable front to the scheduler thread. Commands from any thread are
/// funneled into the single ordered queue.
#[derive(Clone)]
pub struct SchedulerHandle {
    cmd_tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Admit an inbound PCM16 chunk for decoding and scheduling.
    pub fn on_audio(&self, bytes: Vec<u8>) {
        let _ = self.cmd_tx.send(SchedulerCommand::Audio(bytes));
    }

    /// Barge-in: stop output, discard the active set, reset the cursor.
    pub fn on_interrupt(&self) {
        let _ = self.cmd_tx.send(SchedulerCommand::Interrupt);
    }

    /// Teardown clearing without conversational events.
    pub fn flush(&self) {
        let _ = self.cmd_tx.send(SchedulerCommand::Flush);
    }
}

/// The scheduler: dedicated thread owning the core, the clock, and the sink.
pub struct PlaybackScheduler {
    handle: SchedulerHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PlaybackScheduler {
    /// Start the scheduler thread. `sample_rate` is the engine's synthesized
    /// output rate; `event_tx` receives speaking transitions.
    pub fn start(
        clock: Arc<dyn OutputClock>,
        out_factory: OutFactory,
        sample_rate: u32,
        event_tx: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let thread = std::thread::spawn(move || {
            let out = match out_factory() {
                Ok(o) => o,
                Err(e) => {
                    error!(error = %e, "output sink init failed, scheduler not running");
                    return;
                }
            };
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "scheduler runtime init failed");
                    return;
                }
            };
            rt.block_on(run_scheduler(clock, out, sample_rate, cmd_rx, event_tx));
        });

        Self {
            handle: SchedulerHandle { cmd_tx },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stop the scheduler thread and wait for it to drain.
    pub fn shutdown(&mut self) {
        let _ = self.handle.cmd_tx.send(SchedulerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_scheduler(
    clock: Arc<dyn OutputClock>,
    mut out: Box<dyn AudioOut>,
    sample_rate: u32,
    mut cmd_rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    event_tx: mpsc::UnboundedSender<PlaybackEvent>,
) {
    let mut core = SchedulerCore::new(clock.now());
    let mut tick = tokio::time::interval(FINISH_POLL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!("playback scheduler running");
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SchedulerCommand::Audio(bytes)) => {
                        let samples = match codec::decode_pcm(&bytes) {
                            Ok(s) => s,
                            Err(e) => {
                                // Skip the chunk, keep the session.
                                warn!(error = %e, "dropping undecodable audio chunk");
                                continue;
                            }
                        };
                        if samples.is_empty() {
                            continue;
                        }
                        let duration = codec::buffer_duration(samples.len(), sample_rate);
                        // Admit only what the sink accepted: a rejected
                        // buffer must not advance the cursor and leave a
                        // silent gap in front of later buffers.
                        if let Err(e) = out.play(&samples, sample_rate) {
                            warn!(error = %e, "output sink rejected buffer, skipping");
                            continue;
                        }
                        let (start, started) = core.admit(duration, clock.now());
                        debug!(start, duration, queued = core.active_len(), "scheduled buffer");
                        if started {
                            let _ = event_tx.send(PlaybackEvent::SpeakingStarted);
                        }
                    }
                    Some(SchedulerCommand::Interrupt) => {
                        out.stop_all();
                        core.interrupt(clock.now());
                        // Ordered behind any SpeakingStarted already emitted,
                        // so the speaking flag settles false even when the
                        // interrupt races the first chunk of a turn.
                        let _ = event_tx.send(PlaybackEvent::SpeakingInterrupted);
                        info!("barge-in: flushed active set, cursor reset to output time");
                    }
                    Some(SchedulerCommand::Flush) => {
                        out.stop_all();
                        core.flush(clock.now());
                        debug!("scheduler flushed");
                    }
                    Some(SchedulerCommand::Shutdown) | None => break,
                }
            }
            _ = tick.tick() => {
                if core.reap_finished(clock.now()) {
                    let _ = event_tx.send(PlaybackEvent::SpeakingStopped);
                }
            }
        }
    }
    out.stop_all();
    debug!("playback scheduler stopped");
}
