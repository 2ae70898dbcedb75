use std::sync::Arc;

use bytes::Bytes;
use grange_core::Transport;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{FaultAction, FaultInjector};

/// A bidirectional in-process link with a fault injector on both
/// directions, severable mid-test to simulate transport loss.
pub struct Link {
    pumps: [JoinHandle<()>; 2],
}

impl Link {
    /// Kills both pump tasks. Each endpoint observes a closed transport.
    pub fn sever(&self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Builds a connected transport pair whose datagrams flow through the
/// given injector. Returns `(side_a, side_b, link)`.
pub fn linked_pair(injector: Arc<FaultInjector>) -> (Transport, Transport, Link) {
    let (a, pump_a) = Transport::channel();
    let (b, pump_b) = Transport::channel();

    let a_to_b = tokio::spawn(pump(pump_a.outbound, pump_b.inbound, injector.clone()));
    let b_to_a = tokio::spawn(pump(pump_b.outbound, pump_a.inbound, injector));

    (
        a,
        b,
        Link {
            pumps: [a_to_b, b_to_a],
        },
    )
}

/// Forwards datagrams one way, applying fault actions in order. Delays
/// are head-of-line so ordering is preserved.
async fn pump(
    mut from: mpsc::Receiver<Bytes>,
    to: mpsc::Sender<Bytes>,
    injector: Arc<FaultInjector>,
) {
    while let Some(datagram) = from.recv().await {
        match injector.check() {
            FaultAction::Drop => continue,
            FaultAction::Delay(delay) => tokio::time::sleep(delay).await,
            FaultAction::Pass => {}
        }
        if to.send(datagram).await.is_err() {
            break;
        }
    }
}
