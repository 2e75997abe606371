//! keyhole_ipc
//!
//! The wire protocol, frame codec, server, and client for the channel
//! between the agent process and the sidecar (§4.6): a private Unix
//! domain socket, length-prefixed JSON frames, and one-time-token auth on
//! every message.

pub mod client;
pub mod framing;
pub mod server;
pub mod wire;

pub use client::{Client, ClientError};
pub use framing::{read_frame, write_frame, FramingError, MAX_FRAME_SIZE};
pub use server::{RequestHandler, Server, ServerError};
pub use wire::{health_response, BodyEncoding, IpcRequest, IpcResponse, SidecarState, HEALTH_SERVICE};

use rand::RngCore;
use std::path::PathBuf;

/// A private socket path under `dir`, suffixed with 16 random hex bytes
/// (§4.6) so a predictable path can't be raced by another local process.
pub fn generate_socket_path(dir: &std::path::Path) -> PathBuf {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    dir.join(format!("keyhole-{}.sock", keyhole_common::to_hex(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_socket_paths_are_unique() {
        let dir = std::env::temp_dir();
        let a = generate_socket_path(&dir);
        let b = generate_socket_path(&dir);
        assert_ne!(a, b);
    }
}
