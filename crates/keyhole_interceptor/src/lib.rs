//! keyhole_interceptor
//!
//! The agent-side half of the credential firewall (§2, §4.9): a library
//! the agent process links against to have its outbound HTTP calls to
//! declared services routed through the sidecar instead of going out
//! directly with real credentials in hand — because the agent never holds
//! real credentials at all.
//!
//! - [`resolver`] — host/path → service resolution.
//! - [`body`] — the 10 MiB body cap and stream-style chunk accumulator.
//! - [`response`] — decoding an `IpcResponse` back into a synthetic
//!   response object.
//! - [`transport`] — [`transport::InterceptedTransport`], the
//!   `install()`/`uninstall()` patch handle described in §9.

pub mod body;
pub mod resolver;
pub mod response;
pub mod transport;

pub use body::{BodyAccumulator, BodyTooLarge, FinalizedBody, MAX_BODY_BYTES};
pub use resolver::Resolver;
pub use response::{ResponseBody, ResponseError, SyntheticResponse};
pub use transport::{InterceptedTransport, OriginalTransport, OutboundCall, TransportError};
