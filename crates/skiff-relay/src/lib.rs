pub mod client;
pub mod error;
pub mod normalize;
pub mod relay;
pub mod sse;

pub use client::{AgentServerClient, OpenCodeClient, RawEventStream, RelayConfig};
pub use error::{RelayError, Result};
pub use normalize::{normalize, Normalized};
pub use relay::{relay_turn, TurnRequest};
pub use sse::RawAgentEvent;
