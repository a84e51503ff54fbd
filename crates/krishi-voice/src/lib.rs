//! # Krishi Voice - Real-Time Duplex Advisory Sessions
//!
//! This crate implements the live voice link of the Krishi advisory app:
//! microphone capture streamed to a remote conversational engine, synthesized
//! speech scheduled gaplessly on the way back, and correct barge-in handling
//! when the farmer talks over the advisor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Session Controller                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐     │
//! │  │   Mic In     │→ │ Frame Codec  │→ │   Engine     │     │
//! │  │    (cpal)    │  │ (PCM16/b64)  │  │   Channel    │     │
//! │  └──────────────┘  └──────────────┘  └──────┬───────┘     │
//! │         ↓                                    ↓              │
//! │  ┌──────────────┐                   ┌──────────────┐      │
//! │  │  Audio Out   │←──────────────────│   Playback   │      │
//! │  │   (rodio)    │   Barge-in Flush  │  Scheduler   │      │
//! │  └──────────────┘                   └──────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod codec;
pub mod error;
pub mod language;
pub mod playback;
pub mod session;
pub mod transport;

pub use capture::{AudioConfig, CaptureBackend, CaptureFrame, CaptureHandle, MicCapture};
pub use codec::EncodedChunk;
pub use error::{SessionError, SessionResult};
pub use language::{display_name, system_instruction, DEFAULT_LANGUAGE};
pub use playback::{
    AudioOut, ManualClock, NullOut, OutputClock, PlaybackEvent, PlaybackScheduler, RodioOut,
    SchedulerCore, SchedulerHandle, SessionClock,
};
pub use session::{
    SessionConfig, SessionController, SessionEvent, SessionState, SessionStatus,
};
pub use transport::{
    parse_server_message, EngineChannel, EngineConnector, LiveConnector, TransportConfig,
    TransportEvent,
};
