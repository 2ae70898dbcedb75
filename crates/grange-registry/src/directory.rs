use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use grange_core::{InterfaceId, MethodOrdinal, Zone};
use grange_wire::HandshakeAck;
use parking_lot::RwLock;

use crate::{InterfaceDescriptor, RegistryError};

/// What one connected server contributed.
struct ServerContribution {
    interfaces: Vec<Arc<InterfaceDescriptor>>,
    /// Logical timestamp of the contributing handshake; later wins ties.
    seq: u64,
}

struct ZoneOwner {
    server_id: String,
    seq: u64,
}

struct InterfaceRoute {
    descriptor: Arc<InterfaceDescriptor>,
    providers: Vec<String>,
    /// Servers whose manifest contradicts the canonical shape. Never
    /// routed to.
    quarantined: Vec<String>,
    cursor: AtomicUsize,
}

#[derive(Default)]
struct DirectoryInner {
    servers: HashMap<String, ServerContribution>,
    routes: HashMap<InterfaceId, InterfaceRoute>,
    zones: HashMap<Zone, ZoneOwner>,
    next_seq: u64,
}

/// Client-side aggregation of every connected server's manifest.
///
/// Contributions are tagged by server id: a reconnect replaces that
/// server's prior manifest wholesale, and a dropped connection purges it.
/// Lookups for interfaces only a dropped server offered then fail with
/// `NoProvider` at the dispatch layer.
pub struct RemoteDirectory {
    inner: RwLock<DirectoryInner>,
}

impl RemoteDirectory {
    pub fn new() -> Self {
        RemoteDirectory {
            inner: RwLock::new(DirectoryInner::default()),
        }
    }

    /// Ingests a server's handshake acknowledgement.
    ///
    /// The wire manifest is validated before any state changes; a manifest
    /// this server cannot parse leaves the directory untouched.
    pub fn apply_handshake(
        &self,
        server_id: &str,
        ack: &HandshakeAck,
    ) -> Result<(), RegistryError> {
        let mut parsed = Vec::with_capacity(ack.manifest.interfaces.len());
        for entry in &ack.manifest.interfaces {
            parsed.push(Arc::new(InterfaceDescriptor::from_wire_order(
                &entry.interface_id,
                entry.methods.clone(),
            )?));
        }

        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        inner.servers.insert(
            server_id.to_string(),
            ServerContribution {
                interfaces: parsed,
                seq,
            },
        );

        // Zone knowledge: a fresh handshake is the most recent update, so
        // its snapshot overwrites older claims.
        if let Some(zone) = ack.zone {
            inner.zones.insert(
                zone,
                ZoneOwner {
                    server_id: server_id.to_string(),
                    seq,
                },
            );
        }
        for (zone, owner) in &ack.zone_map {
            inner.zones.insert(
                *zone,
                ZoneOwner {
                    server_id: owner.clone(),
                    seq,
                },
            );
        }

        inner.rebuild_routes();
        Ok(())
    }

    /// Removes everything a dropped server contributed: its manifest
    /// entries and any zone claims that routed to it.
    pub fn purge_server(&self, server_id: &str) {
        let mut inner = self.inner.write();
        if inner.servers.remove(server_id).is_none() {
            return;
        }
        inner.zones.retain(|_, owner| owner.server_id != server_id);
        inner.rebuild_routes();
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.inner.read().servers.contains_key(server_id)
    }

    pub fn connected_servers(&self) -> Vec<String> {
        self.inner.read().servers.keys().cloned().collect()
    }

    /// The authoritative descriptor for an interface, if any connected
    /// server offers it.
    pub fn descriptor(&self, interface: &InterfaceId) -> Option<Arc<InterfaceDescriptor>> {
        self.inner
            .read()
            .routes
            .get(interface)
            .map(|r| r.descriptor.clone())
    }

    /// Resolves a method name against the authoritative manifest.
    pub fn ordinal(&self, interface: &InterfaceId, method: &str) -> Option<MethodOrdinal> {
        self.inner
            .read()
            .routes
            .get(interface)?
            .descriptor
            .ordinal_of(method)
    }

    /// Routable providers for an interface, excluding quarantined servers.
    pub fn providers(&self, interface: &InterfaceId) -> Vec<String> {
        self.inner
            .read()
            .routes
            .get(interface)
            .map(|r| r.providers.clone())
            .unwrap_or_default()
    }

    /// Picks a provider: the sole one when unambiguous, round-robin
    /// otherwise. `None` means no provider.
    pub fn select_provider(&self, interface: &InterfaceId) -> Option<String> {
        let inner = self.inner.read();
        let route = inner.routes.get(interface)?;
        match route.providers.len() {
            0 => None,
            1 => Some(route.providers[0].clone()),
            n => {
                let i = route.cursor.fetch_add(1, Ordering::Relaxed) % n;
                Some(route.providers[i].clone())
            }
        }
    }

    /// The server currently owning a zone, if any.
    pub fn server_for_zone(&self, zone: Zone) -> Option<String> {
        self.inner
            .read()
            .zones
            .get(&zone)
            .map(|owner| owner.server_id.clone())
    }
}

impl Default for RemoteDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryInner {
    /// Recomputes the interface routing index from the surviving
    /// contributions. The earliest-applied server's shape is canonical;
    /// later conflicting servers are quarantined.
    fn rebuild_routes(&mut self) {
        let cursors: HashMap<InterfaceId, usize> = self
            .routes
            .drain()
            .map(|(id, route)| (id, route.cursor.load(Ordering::Relaxed)))
            .collect();

        let mut order: Vec<(&String, &ServerContribution)> = self.servers.iter().collect();
        order.sort_by_key(|(_, c)| c.seq);

        for (server_id, contribution) in order {
            for descriptor in &contribution.interfaces {
                let id = descriptor.interface_id().clone();
                match self.routes.get_mut(&id) {
                    None => {
                        let cursor = cursors.get(&id).copied().unwrap_or(0);
                        self.routes.insert(
                            id,
                            InterfaceRoute {
                                descriptor: descriptor.clone(),
                                providers: vec![server_id.clone()],
                                quarantined: Vec::new(),
                                cursor: AtomicUsize::new(cursor),
                            },
                        );
                    }
                    Some(route) => {
                        if route.descriptor.same_shape(descriptor) {
                            route.providers.push(server_id.clone());
                        } else {
                            tracing::error!(
                                interface = %descriptor.interface_id(),
                                server = %server_id,
                                "manifest contradicts another server's method \
                                 ordering for this interface; refusing to route there"
                            );
                            route.quarantined.push(server_id.clone());
                        }
                    }
                }
            }
        }
    }
}
