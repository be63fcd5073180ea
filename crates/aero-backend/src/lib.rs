pub mod adapter;
pub mod anthropic;
pub mod anthropic_stream;
pub mod classify;
pub mod gemini;
pub mod gemini_stream;
pub mod health;
pub mod http;
pub mod openai;
pub mod openai_stream;
pub mod router;
pub mod stream;

pub use adapter::{BackendAdapter, BackendError, CallContext};
pub use classify::FailureClass;
pub use health::{BackendHealthEntry, BackendStatus, HealthTracker};
pub use router::{BackendFailure, BackendRouter, RouteOutcome, RouterError, RouterSlot};
pub use stream::StreamEvent;
