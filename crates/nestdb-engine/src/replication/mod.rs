//! Replication: live command bus, secondary agent, write forwarding.

mod bus;
mod forwarder;
mod http;
mod secondary;
pub mod stream;

// Re-exports
pub use bus::{Bus, Event, Subscription, BUS_BUFFER};
pub use forwarder::{ForwardRequest, ForwardResponse, Forwarder};
pub use secondary::{Secondary, PROGRESS_FILE};
pub use stream::{parse_since, stream_history, stream_path, EventStream, STREAM_PATH};
