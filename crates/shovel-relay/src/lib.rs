//! Bidirectional byte relay
//!
//! Forwards traffic between two duplex endpoints, typically the two ends of a
//! forwarded port. The interesting part is shutdown: both directions always
//! stop together, each endpoint is released exactly once, and any number of
//! observers can wait for completion through the [`HaltNode`] of a relay or
//! pair.
//!
//! ```text
//!             RelayPair (HaltNode)
//!           ┌──────────┴──────────┐
//!   A <──── Relay "ab" <──── B    │
//!   A ────> Relay "ba" ────> B    │
//!           └─────── watchdog ────┘
//! ```
//!
//! Endpoint setup (accepting sockets, opening tunnel streams) happens
//! elsewhere; anything implementing [`Endpoint`] can be relayed.
//! [`StreamEndpoint`] wraps any tokio stream.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod pair;
pub mod relay;
pub mod tee;

pub use config::RelayConfig;
pub use endpoint::{Close, Endpoint, Sink, Source, StreamEndpoint};
pub use error::RelayError;
pub use pair::RelayPair;
pub use relay::{Relay, RelayState, COPY_BUFFER_SIZE};
pub use shovel_halt::{HaltNode, Signal};
pub use tee::LogSink;
