use grange_core::{InterfaceId, MethodOrdinal};

use crate::{MAX_INTERFACE_ID_LEN, MAX_METHOD_NAME_LEN, RegistryError};

/// One method of an interface with its precomputed ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub ordinal: MethodOrdinal,
}

/// Precomputed method table for one interface.
///
/// Ordinals are positions in the method list sorted by strict byte-wise
/// comparison of method names, so identical interface shapes produce
/// identical ordinals on both peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    interface_id: InterfaceId,
    methods: Vec<MethodDescriptor>,
}

impl InterfaceDescriptor {
    /// Builds a descriptor from an unordered method list, sorting by name
    /// to assign ordinals. This is what server-side registration and local
    /// client bindings use.
    pub fn new<I, S>(interface_id: impl AsRef<str>, methods: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = methods.into_iter().map(Into::into).collect();
        names.sort_unstable();
        Self::from_ordered(interface_id, names)
    }

    /// Builds a descriptor from a method list whose order is already
    /// authoritative — the form manifests arrive in. The order is
    /// preserved verbatim; ordinals are the given positions.
    pub fn from_wire_order(
        interface_id: impl AsRef<str>,
        methods: Vec<String>,
    ) -> Result<Self, RegistryError> {
        Self::from_ordered(interface_id, methods)
    }

    fn from_ordered(
        interface_id: impl AsRef<str>,
        names: Vec<String>,
    ) -> Result<Self, RegistryError> {
        let id = interface_id.as_ref();
        if id.is_empty() {
            return Err(RegistryError::EmptyInterfaceId);
        }
        if id.len() > MAX_INTERFACE_ID_LEN {
            return Err(RegistryError::InterfaceIdTooLong);
        }
        if names.len() > u16::MAX as usize {
            return Err(RegistryError::TooManyMethods);
        }
        let mut methods = Vec::with_capacity(names.len());
        for (i, name) in names.into_iter().enumerate() {
            if name.is_empty() {
                return Err(RegistryError::EmptyMethodName);
            }
            if name.len() > MAX_METHOD_NAME_LEN {
                return Err(RegistryError::MethodNameTooLong);
            }
            if methods.iter().any(|m: &MethodDescriptor| m.name == name) {
                return Err(RegistryError::DuplicateMethod(name));
            }
            methods.push(MethodDescriptor {
                name,
                ordinal: MethodOrdinal(i as u16),
            });
        }
        Ok(InterfaceDescriptor {
            interface_id: InterfaceId::new(id),
            methods,
        })
    }

    pub fn interface_id(&self) -> &InterfaceId {
        &self.interface_id
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn ordinal_of(&self, method_name: &str) -> Option<MethodOrdinal> {
        self.methods
            .iter()
            .find(|m| m.name == method_name)
            .map(|m| m.ordinal)
    }

    pub fn method_name(&self, ordinal: MethodOrdinal) -> Option<&str> {
        self.methods
            .get(ordinal.0 as usize)
            .map(|m| m.name.as_str())
    }

    /// Method names in ordinal order, as they appear in a manifest.
    pub fn method_names(&self) -> Vec<String> {
        self.methods.iter().map(|m| m.name.clone()).collect()
    }

    /// Whether another descriptor advertises the same methods in the same
    /// order. Two manifests disagreeing here must never be routed
    /// interchangeably.
    pub fn same_shape(&self, other: &InterfaceDescriptor) -> bool {
        self.interface_id == other.interface_id
            && self.methods.len() == other.methods.len()
            && self
                .methods
                .iter()
                .zip(other.methods.iter())
                .all(|(a, b)| a.name == b.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_follow_sorted_names() {
        // Registration order is irrelevant; byte-wise name order decides.
        let d = InterfaceDescriptor::new("game.Ping", ["pong", "ping"]).unwrap();
        assert_eq!(d.ordinal_of("ping"), Some(MethodOrdinal(0)));
        assert_eq!(d.ordinal_of("pong"), Some(MethodOrdinal(1)));
    }

    #[test]
    fn sorting_is_byte_wise() {
        // Uppercase sorts before lowercase in byte comparison.
        let d = InterfaceDescriptor::new("i", ["apply", "Zero"]).unwrap();
        assert_eq!(d.ordinal_of("Zero"), Some(MethodOrdinal(0)));
        assert_eq!(d.ordinal_of("apply"), Some(MethodOrdinal(1)));
    }

    #[test]
    fn wire_order_is_preserved() {
        let d = InterfaceDescriptor::from_wire_order(
            "game.Ping",
            vec!["zulu".into(), "alpha".into()],
        )
        .unwrap();
        assert_eq!(d.ordinal_of("zulu"), Some(MethodOrdinal(0)));
        assert_eq!(d.ordinal_of("alpha"), Some(MethodOrdinal(1)));
    }

    #[test]
    fn ordinal_lookup_both_ways() {
        let d = InterfaceDescriptor::new("game.Ping", ["ping", "pong"]).unwrap();
        assert_eq!(d.method_name(MethodOrdinal(1)), Some("pong"));
        assert_eq!(d.method_name(MethodOrdinal(2)), None);
        assert_eq!(d.ordinal_of("quux"), None);
    }

    #[test]
    fn duplicate_method_rejected() {
        assert_eq!(
            InterfaceDescriptor::new("i", ["ping", "ping"]).err(),
            Some(RegistryError::DuplicateMethod("ping".into()))
        );
    }

    #[test]
    fn empty_names_rejected() {
        assert_eq!(
            InterfaceDescriptor::new("", ["ping"]).err(),
            Some(RegistryError::EmptyInterfaceId)
        );
        assert_eq!(
            InterfaceDescriptor::new("i", [""]).err(),
            Some(RegistryError::EmptyMethodName)
        );
    }

    #[test]
    fn long_names_rejected() {
        let long = "x".repeat(MAX_METHOD_NAME_LEN + 1);
        assert_eq!(
            InterfaceDescriptor::new("i", [long]).err(),
            Some(RegistryError::MethodNameTooLong)
        );
    }

    #[test]
    fn same_shape_detects_reordering() {
        let a = InterfaceDescriptor::from_wire_order("i", vec!["a".into(), "b".into()]).unwrap();
        let b = InterfaceDescriptor::from_wire_order("i", vec!["b".into(), "a".into()]).unwrap();
        let c = InterfaceDescriptor::from_wire_order("i", vec!["a".into(), "b".into()]).unwrap();
        assert!(!a.same_shape(&b));
        assert!(a.same_shape(&c));
    }
}
