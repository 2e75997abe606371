//! Entry point for the sidecar process itself. Spawned by
//! [`keyhole_sidecar::supervisor::Supervisor`] with its stdin/stdout piped
//! for the §4.8 bootstrap handshake; everything else happens over the IPC
//! socket it reports back.

use keyhole_sidecar::child;

#[tokio::main]
async fn main() {
    if let Err(e) = child::run().await {
        eprintln!("keyhole-sidecard: {e}");
        std::process::exit(1);
    }
}
