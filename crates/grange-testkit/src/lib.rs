//! Test plumbing for the grange runtime: loopback client/server wiring,
//! a severable link for connection-loss scenarios, and a fault injector
//! for drop/delay experiments on the datagram path.

mod fault;
mod link;

pub use fault::*;
pub use link::*;

use grange_client::GrainClient;
use grange_core::{CallError, Transport, UserIdentity};
use grange_server::ServerRuntime;

/// Wires a client to a server over an in-process pair and completes the
/// handshake. Returns the server id the client now routes by.
pub async fn connect_loopback(
    server: &ServerRuntime,
    client: &GrainClient,
    principal: Option<UserIdentity>,
) -> Result<String, CallError> {
    let (client_side, server_side) = Transport::mem_pair();
    server.accept(server_side, principal);
    client.connect(client_side).await
}
