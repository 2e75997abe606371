//! keyhole_sidecar
//!
//! The trusted half of the credential firewall: the process that actually
//! holds resolved secrets, the IPC server the untrusted agent process talks
//! to, and the parent-side supervisor that spawns and bootstraps it (§4.8).
//!
//! - [`state`] — the `Phase` state machine.
//! - [`bootstrap`] — the parent↔child handshake protocol over stdin/stdout.
//! - [`handler`] — [`handler::SidecarRuntime`] / [`handler::SidecarHandler`],
//!   the `RequestHandler` that does auth injection, dispatch, and masking.
//! - [`child`] — the sidecar binary's own `run()` loop.
//! - [`supervisor`] — the parent-side `Supervisor` that spawns the child and
//!   owns the agent-facing [`keyhole_ipc::Client`].

pub mod bootstrap;
pub mod child;
pub mod handler;
pub mod state;
pub mod supervisor;

pub use handler::{SidecarHandler, SidecarRuntime, SwappableHandler};
pub use state::Phase;
pub use supervisor::{Supervisor, SupervisorError};
