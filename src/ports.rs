use std::net::{Ipv4Addr, TcpListener};

use crate::error::RunnerResult;

/// Asks the OS for a free loopback port and releases it right away.
///
/// The port was free when we looked; another process can still grab it before
/// the container runtime binds it. That race shows up later as a runtime
/// failure and is not retried.
pub fn allocate_free_port() -> RunnerResult<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    tracing::debug!(port, "allocated free port");
    Ok(port)
}
