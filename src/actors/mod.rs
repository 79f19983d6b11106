//! Actor-based daemon core
//!
//! Each actor runs as an independent async task communicating via Tokio channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!   agents ──ndjson──▶ Listener ──ProcessorCommand──▶ Processor ──▶ collector
//!                                                     ▲
//!                          HarvestTrigger ──ticks─────┘
//! ```
//!
//! ## Actor Types
//!
//! - **Listener**: Accepts agent connections and forwards requests
//! - **Processor**: Owns apps and harvests, connects and sends payloads
//! - **HarvestTrigger**: Emits harvest ticks per app on one or more cadences
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: The processor has an mpsc command channel
//! 2. **Ticks**: Triggers share one mpsc channel into the processor
//! 3. **Request/Response**: oneshot channels for replies and cancel acks

pub mod listener;
pub mod messages;
pub mod processor;
pub mod trigger;
