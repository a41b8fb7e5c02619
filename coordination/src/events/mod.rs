//! Event plumbing between the session and the transport layer
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  InboundEvent   ┌───────────────┐  OutboundEvent  ┌─────────────┐
//! │  Transport   │────────────────▶│ SurveySession │────────────────▶│  EventSink  │
//! │ (ws / stdio) │                 │  coordinator, │    publish()    │   (mpsc)    │
//! └──────────────┘                 │  generator    │                 └──────┬──────┘
//!        ▲                         └───────────────┘                        │
//!        └──────────────────────────── recv() ──────────────────────────────┘
//! ```
//!
//! Event payloads are the transport contract; only the state transitions
//! they trigger are guaranteed.

pub mod sink;
pub mod types;

pub use sink::{EventReceiver, EventSink, SharedEventSink, SinkError, SinkResult};
pub use types::{InboundEvent, OutboundEvent};
