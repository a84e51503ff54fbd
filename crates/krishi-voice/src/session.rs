//! Session controller: the state machine orchestrating capture, transport,
//! and playback for one live conversation.
//!
//! One-directional ownership: the controller owns the capture pipeline and
//! the playback scheduler; they report upward through channels, never
//! through back-references. A language change is a full session replacement
//! (teardown, grace delay, rebuild) — the engine fixes language at open.

use crate::capture::{
    spawn_capture_pipeline, AudioConfig, CaptureBackend, CaptureHandle, MicCapture,
};
use crate::error::{SessionError, SessionResult};
use crate::language;
use crate::playback::{
    AudioOut, OutputClock, PlaybackEvent, PlaybackScheduler, RodioOut, SessionClock,
};
use crate::transport::{EngineConnector, LiveConnector, TransportConfig, TransportEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Session lifecycle: `Idle → Connecting → Active → Closing → Idle`, with
/// `Active → Error → Idle` on unrecoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Error,
}

/// State transition events for subscribers. The controller renders nothing.
#[derive(Debug, Clone, Serialize)]
pub enum SessionEvent {
    Opened,
    Closed,
    SpeakingStarted,
    SpeakingStopped,
    Error(String),
}

/// UI-facing snapshot published over a watch channel.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub is_speaking: bool,
    pub is_listening: bool,
    pub activity_level: f32,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            is_speaking: false,
            is_listening: false,
            activity_level: 0.0,
        }
    }
}

/// Configuration for the session controller.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub audio: AudioConfig,
    pub transport: TransportConfig,
    /// Grace delay between teardown and rebuild on a language change, so the
    /// new channel does not race the old one's close. Tuning, not
    /// correctness.
    pub reconnect_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            transport: TransportConfig::default(),
            reconnect_grace: Duration::from_millis(500),
        }
    }
}

/// How long teardown waits for pipeline tasks to drain.
const TEARDOWN_WAIT: Duration = Duration::from_millis(500);

struct SessionShared {
    state: Mutex<SessionState>,
    status: watch::Sender<SessionStatus>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("state lock poisoned") = state;
        self.status.send_modify(|s| {
            s.state = state;
            s.is_listening = state == SessionState::Active;
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Resources of one live connection. Destroyed and replaced, never mutated,
/// on language change.
struct LiveSession {
    target_language: String,
    started_at: DateTime<Utc>,
    capture_handle: Box<dyn CaptureHandle>,
    capture_task: tokio::task::JoinHandle<()>,
    scheduler: PlaybackScheduler,
    router_task: tokio::task::JoinHandle<()>,
    chunk_tx: mpsc::Sender<crate::codec::EncodedChunk>,
}

/// Builder for the output sink; invoked once per connection on the scheduler
/// thread.
pub type OutBuilder = Arc<dyn Fn() -> SessionResult<Box<dyn AudioOut>> + Send + Sync>;

/// The only component with global session state.
pub struct SessionController {
    config: SessionConfig,
    connector: Arc<dyn EngineConnector>,
    capture: Arc<dyn CaptureBackend>,
    clock: Arc<dyn OutputClock>,
    out_builder: OutBuilder,
    shared: Arc<SessionShared>,
    live: Option<LiveSession>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl SessionController {
    /// Production wiring: real microphone, real engine, real output sink.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(LiveConnector),
            Arc::new(MicCapture),
            Arc::new(SessionClock::new()),
            Arc::new(|| Ok(Box::new(RodioOut::new()?) as Box<dyn AudioOut>)),
        )
    }

    /// Explicit wiring, e.g. for tests or non-default devices.
    pub fn with_parts(
        config: SessionConfig,
        connector: Arc<dyn EngineConnector>,
        capture: Arc<dyn CaptureBackend>,
        clock: Arc<dyn OutputClock>,
        out_builder: OutBuilder,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::default());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connector,
            capture,
            clock,
            out_builder,
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState::Idle),
                status: status_tx,
                events: event_tx,
            }),
            live: None,
            event_rx: Some(event_rx),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Subscribe to the UI snapshot.
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Take the event receiver. Only available once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Open a session for `language_code`. Valid only from `Idle`.
    ///
    /// Acquires the microphone, opens the engine channel configured for the
    /// resolved language, starts the capture pipeline, and arms the playback
    /// scheduler. On any failure every acquired resource is released and the
    /// session returns to `Idle`.
    pub async fn connect(&mut self, language_code: &str) -> SessionResult<()> {
        {
            let mut state = self.shared.state.lock().expect("state lock poisoned");
            if *state != SessionState::Idle {
                return Err(SessionError::InvalidState(format!(
                    "connect requires Idle, session is {:?}",
                    *state
                )));
            }
            *state = SessionState::Connecting;
        }
        self.shared.status.send_modify(|s| s.state = SessionState::Connecting);

        let language_name = language::display_name(language_code);
        info!(code = %language_code, language = %language_name, "connecting voice session");

        // Microphone first: a denied device means the session never starts.
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let capture_handle = match self.capture.open(&self.config.audio, frame_tx) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "microphone unavailable");
                self.shared.set_state(SessionState::Idle);
                self.shared.emit(SessionEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let mut transport_config = self.config.transport.clone();
        transport_config.language_name = language_name.to_string();

        let channel = match self.connector.connect(&transport_config).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "engine channel failed to open");
                drop(capture_handle); // release the microphone
                self.shared.set_state(SessionState::Idle);
                self.shared.emit(SessionEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        // Playback scheduler on its own thread (owns the !Send sink).
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let out_builder = self.out_builder.clone();
        let scheduler = PlaybackScheduler::start(
            self.clock.clone(),
            Box::new(move || out_builder()),
            transport_config.output_sample_rate,
            playback_tx,
        );

        // Capture pipeline: frames -> level meter + encoded chunks.
        let (level_tx, level_rx) = watch::channel(0.0f32);
        let capture_task = spawn_capture_pipeline(
            self.config.audio.clone(),
            frame_rx,
            channel.chunk_tx.clone(),
            level_tx,
        );
        spawn_level_pump(self.shared.clone(), level_rx);
        spawn_playback_pump(self.shared.clone(), playback_rx);

        let router_task = spawn_inbound_router(
            self.shared.clone(),
            channel.event_rx,
            scheduler.handle(),
        );

        self.live = Some(LiveSession {
            target_language: language_code.to_string(),
            started_at: Utc::now(),
            capture_handle,
            capture_task,
            scheduler,
            router_task,
            chunk_tx: channel.chunk_tx,
        });
        self.shared.set_state(SessionState::Active);
        self.shared.emit(SessionEvent::Opened);
        info!("voice session active");
        Ok(())
    }

    /// Tear the session down. Valid from any state, idempotent, and safe to
    /// call from `Error`. Releases the microphone and closes the engine
    /// channel exactly once.
    pub async fn disconnect(&mut self) -> SessionResult<()> {
        if self.shared.state() == SessionState::Idle && self.live.is_none() {
            debug!("disconnect on idle session: no-op");
            return Ok(());
        }
        self.shared.set_state(SessionState::Closing);

        if let Some(mut live) = self.live.take() {
            info!(language = %live.target_language, started_at = %live.started_at, "closing voice session");

            // Release the microphone; the capture pipeline drains and ends.
            drop(live.capture_handle);
            let _ = tokio::time::timeout(TEARDOWN_WAIT, live.capture_task).await;

            // Flush pending output, then stop the scheduler thread.
            live.scheduler.handle().flush();
            live.scheduler.shutdown();

            // Dropping the last chunk sender closes the outbound side, which
            // closes the websocket; the router ends on the Closed event.
            drop(live.chunk_tx);
            let _ = tokio::time::timeout(TEARDOWN_WAIT, live.router_task).await;
        }

        self.shared.set_state(SessionState::Idle);
        self.shared.status.send_modify(|s| {
            s.is_speaking = false;
            s.activity_level = 0.0;
        });
        self.shared.emit(SessionEvent::Closed);
        Ok(())
    }

    /// Switch language: observable as disconnect immediately followed by
    /// connect with the new configuration.
    pub async fn reconfigure(&mut self, language_code: &str) -> SessionResult<()> {
        info!(code = %language_code, "reconfiguring session language");
        self.disconnect().await?;
        tokio::time::sleep(self.config.reconnect_grace).await;
        self.connect(language_code).await
    }
}

/// Forward activity levels from the capture pipeline into the UI snapshot.
/// Ends when the pipeline drops its sender.
fn spawn_level_pump(shared: Arc<SessionShared>, mut level_rx: watch::Receiver<f32>) {
    tokio::spawn(async move {
        while level_rx.changed().await.is_ok() {
            let level = *level_rx.borrow();
            shared.status.send_modify(|s| s.activity_level = level);
        }
    });
}

/// Forward speaking transitions from the scheduler into events and the UI
/// snapshot. Ends when the scheduler thread stops.
fn spawn_playback_pump(
    shared: Arc<SessionShared>,
    mut playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = playback_rx.recv().await {
            match event {
                PlaybackEvent::SpeakingStarted => {
                    shared.status.send_modify(|s| s.is_speaking = true);
                    shared.emit(SessionEvent::SpeakingStarted);
                }
                PlaybackEvent::SpeakingStopped => {
                    shared.status.send_modify(|s| s.is_speaking = false);
                    shared.emit(SessionEvent::SpeakingStopped);
                }
                PlaybackEvent::SpeakingInterrupted => {
                    // Settles the flag; no conversational event for a turn
                    // killed mid-flight.
                    shared.status.send_modify(|s| s.is_speaking = false);
                }
            }
        }
    });
}

/// Route inbound engine traffic: audio and interrupts go straight to the
/// scheduler queue (preserving arrival order); failures surface as session
/// errors.
fn spawn_inbound_router(
    shared: Arc<SessionShared>,
    mut event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    scheduler: crate::playback::SchedulerHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                TransportEvent::Audio(bytes) => scheduler.on_audio(bytes),
                TransportEvent::Interrupted => {
                    info!("engine reported barge-in");
                    // The scheduler thread is the only source of speaking
                    // state; it acknowledges with SpeakingInterrupted.
                    scheduler.on_interrupt();
                }
                TransportEvent::TurnComplete => debug!("engine turn complete"),
                TransportEvent::Error(reason) => {
                    warn!(%reason, "engine channel error");
                    if shared.state() == SessionState::Active {
                        shared.set_state(SessionState::Error);
                    }
                    shared.emit(SessionEvent::Error(reason));
                }
                TransportEvent::Closed => {
                    if shared.state() == SessionState::Active {
                        warn!("engine channel dropped unexpectedly");
                        shared.set_state(SessionState::Error);
                        shared.emit(SessionEvent::Error(
                            "engine channel closed unexpectedly".to_string(),
                        ));
                    }
                    break;
                }
            }
        }
        debug!("inbound router ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_defaults_to_idle() {
        let status = SessionStatus::default();
        assert_eq!(status.state, SessionState::Idle);
        assert!(!status.is_speaking);
        assert!(!status.is_listening);
        assert_eq!(status.activity_level, 0.0);
    }

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.transport.output_sample_rate, 24000);
        assert_eq!(config.reconnect_grace, Duration::from_millis(500));
    }
}
