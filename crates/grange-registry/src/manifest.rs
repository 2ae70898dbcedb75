use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use grange_core::InterfaceId;
use grange_wire::{GrainManifestEntry, InterfaceManifestEntry, ManifestWire};

use crate::{
    InterfaceDescriptor, MAX_GRAIN_TYPE_LEN, RegistryError,
};

/// Accumulates a server's grain types, interfaces, and bindings, then
/// freezes them into a [`LocalManifest`].
pub struct ManifestBuilder {
    grains: Vec<(String, BTreeMap<String, String>)>,
    interfaces: Vec<InterfaceDescriptor>,
    bindings: Vec<(InterfaceId, String)>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        ManifestBuilder {
            grains: Vec::new(),
            interfaces: Vec::new(),
            bindings: Vec::new(),
        }
    }

    pub fn add_grain_type(
        &mut self,
        grain_type: impl Into<String>,
        properties: BTreeMap<String, String>,
    ) -> Result<(), RegistryError> {
        let grain_type = grain_type.into();
        if grain_type.is_empty() {
            return Err(RegistryError::EmptyGrainType);
        }
        if grain_type.len() > MAX_GRAIN_TYPE_LEN {
            return Err(RegistryError::GrainTypeTooLong);
        }
        if self.grains.iter().any(|(name, _)| *name == grain_type) {
            return Err(RegistryError::DuplicateGrainType(grain_type));
        }
        self.grains.push((grain_type, properties));
        Ok(())
    }

    pub fn add_interface(&mut self, descriptor: InterfaceDescriptor) -> Result<(), RegistryError> {
        if self
            .interfaces
            .iter()
            .any(|d| d.interface_id() == descriptor.interface_id())
        {
            return Err(RegistryError::DuplicateInterface(
                descriptor.interface_id().to_string(),
            ));
        }
        self.interfaces.push(descriptor);
        Ok(())
    }

    /// Binds an interface to the grain type implementing it. Both sides
    /// must already be registered; one binding per interface.
    pub fn bind(
        &mut self,
        interface_id: impl AsRef<str>,
        grain_type: impl AsRef<str>,
    ) -> Result<(), RegistryError> {
        let interface_id = InterfaceId::new(interface_id.as_ref());
        let grain_type = grain_type.as_ref();
        if !self
            .interfaces
            .iter()
            .any(|d| d.interface_id() == &interface_id)
        {
            return Err(RegistryError::UnknownInterface(interface_id.to_string()));
        }
        if !self.grains.iter().any(|(name, _)| name == grain_type) {
            return Err(RegistryError::UnknownGrainType(grain_type.to_string()));
        }
        if self.bindings.iter().any(|(id, _)| *id == interface_id) {
            return Err(RegistryError::DuplicateBinding(interface_id.to_string()));
        }
        self.bindings.push((interface_id, grain_type.to_string()));
        Ok(())
    }

    pub fn build(self) -> LocalManifest {
        let mut interfaces = HashMap::new();
        for descriptor in self.interfaces {
            interfaces.insert(descriptor.interface_id().clone(), Arc::new(descriptor));
        }
        LocalManifest {
            grain_properties: self.grains.into_iter().collect(),
            interfaces,
            grain_for_interface: self.bindings.into_iter().collect(),
        }
    }
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A server's frozen manifest: what it advertises at handshake and what
/// its inbound dispatcher consults to resolve interfaces.
pub struct LocalManifest {
    grain_properties: HashMap<String, BTreeMap<String, String>>,
    interfaces: HashMap<InterfaceId, Arc<InterfaceDescriptor>>,
    grain_for_interface: HashMap<InterfaceId, String>,
}

impl LocalManifest {
    pub fn interface(&self, id: &InterfaceId) -> Option<Arc<InterfaceDescriptor>> {
        self.interfaces.get(id).cloned()
    }

    pub fn grain_type_for(&self, id: &InterfaceId) -> Option<&str> {
        self.grain_for_interface.get(id).map(String::as_str)
    }

    pub fn grain_properties(&self, grain_type: &str) -> Option<&BTreeMap<String, String>> {
        self.grain_properties.get(grain_type)
    }

    /// The wire form sent inside `HandshakeAck`. Entries are emitted in
    /// sorted order so identical manifests encode byte-identically.
    pub fn wire(&self) -> ManifestWire {
        let mut grains: Vec<GrainManifestEntry> = self
            .grain_properties
            .iter()
            .map(|(grain_type, properties)| GrainManifestEntry {
                grain_type: grain_type.clone(),
                properties: properties.clone(),
            })
            .collect();
        grains.sort_by(|a, b| a.grain_type.cmp(&b.grain_type));

        let mut interfaces: Vec<InterfaceManifestEntry> = self
            .interfaces
            .values()
            .map(|d| InterfaceManifestEntry {
                interface_id: d.interface_id().to_string(),
                methods: d.method_names(),
            })
            .collect();
        interfaces.sort_by(|a, b| a.interface_id.cmp(&b.interface_id));

        let mut interface_to_grain: Vec<(String, String)> = self
            .grain_for_interface
            .iter()
            .map(|(id, grain)| (id.to_string(), grain.clone()))
            .collect();
        interface_to_grain.sort();

        ManifestWire {
            grains,
            interfaces,
            interface_to_grain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_sample() -> LocalManifest {
        let mut b = ManifestBuilder::new();
        b.add_grain_type("Player", BTreeMap::new()).unwrap();
        b.add_interface(InterfaceDescriptor::new("game.Ping", ["pong", "ping"]).unwrap())
            .unwrap();
        b.bind("game.Ping", "Player").unwrap();
        b.build()
    }

    #[test]
    fn builder_resolves_interface_and_binding() {
        let m = build_sample();
        let id = InterfaceId::new("game.Ping");
        let d = m.interface(&id).unwrap();
        assert_eq!(d.method_names(), vec!["ping", "pong"]);
        assert_eq!(m.grain_type_for(&id), Some("Player"));
    }

    #[test]
    fn wire_form_carries_ordinal_order() {
        let wire = build_sample().wire();
        assert_eq!(wire.interfaces.len(), 1);
        assert_eq!(wire.interfaces[0].methods, vec!["ping", "pong"]);
        assert_eq!(
            wire.interface_to_grain,
            vec![("game.Ping".to_string(), "Player".to_string())]
        );
    }

    #[test]
    fn wire_form_is_deterministic() {
        let mut b = ManifestBuilder::new();
        b.add_grain_type("Zed", BTreeMap::new()).unwrap();
        b.add_grain_type("Abel", BTreeMap::new()).unwrap();
        b.add_interface(InterfaceDescriptor::new("b.I", ["m"]).unwrap())
            .unwrap();
        b.add_interface(InterfaceDescriptor::new("a.I", ["m"]).unwrap())
            .unwrap();
        let wire = b.build().wire();
        assert_eq!(wire.grains[0].grain_type, "Abel");
        assert_eq!(wire.interfaces[0].interface_id, "a.I");
    }

    #[test]
    fn duplicate_grain_type_rejected() {
        let mut b = ManifestBuilder::new();
        b.add_grain_type("Player", BTreeMap::new()).unwrap();
        assert_eq!(
            b.add_grain_type("Player", BTreeMap::new()).err(),
            Some(RegistryError::DuplicateGrainType("Player".into()))
        );
    }

    #[test]
    fn binding_requires_both_sides() {
        let mut b = ManifestBuilder::new();
        b.add_grain_type("Player", BTreeMap::new()).unwrap();
        assert_eq!(
            b.bind("game.Ping", "Player").err(),
            Some(RegistryError::UnknownInterface("game.Ping".into()))
        );

        b.add_interface(InterfaceDescriptor::new("game.Ping", ["ping"]).unwrap())
            .unwrap();
        assert_eq!(
            b.bind("game.Ping", "Npc").err(),
            Some(RegistryError::UnknownGrainType("Npc".into()))
        );

        b.bind("game.Ping", "Player").unwrap();
        assert_eq!(
            b.bind("game.Ping", "Player").err(),
            Some(RegistryError::DuplicateBinding("game.Ping".into()))
        );
    }
}
