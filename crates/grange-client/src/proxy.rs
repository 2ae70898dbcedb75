use std::marker::PhantomData;
use std::time::Duration;

use grange_core::{CallError, GrainId, InterfaceId, ProtocolError};
use grange_registry::{InterfaceDescriptor, RegistryError};
use grange_wire::{decode_value, encode_value};
use serde::{Serialize, de::DeserializeOwned};

use crate::GrainClient;

/// A typed client-side binding of a grain interface.
///
/// Implementations name the interface, the grain type implementing it,
/// and the method set. The runtime still treats the manifest received
/// from the server as authoritative for ordinals; the local method list
/// exists so bindings can be checked against manifests.
pub trait GrainInterface {
    const INTERFACE_ID: &'static str;
    const GRAIN_TYPE: &'static str;
    const METHODS: &'static [&'static str];

    /// The locally computed descriptor (ordinals by sorted method names).
    fn descriptor() -> Result<InterfaceDescriptor, RegistryError> {
        InterfaceDescriptor::new(Self::INTERFACE_ID, Self::METHODS.iter().copied())
    }
}

/// Typed proxy bound to one grain id on one client.
pub struct GrainProxy<I: GrainInterface> {
    client: GrainClient,
    grain: GrainId,
    interface: InterfaceId,
    _marker: PhantomData<fn() -> I>,
}

impl GrainClient {
    /// Yields a typed proxy for the grain with the given key.
    pub fn get_grain<I: GrainInterface>(&self, key: impl AsRef<str>) -> GrainProxy<I> {
        GrainProxy {
            client: self.clone(),
            grain: GrainId::new(I::GRAIN_TYPE, key),
            interface: InterfaceId::new(I::INTERFACE_ID),
            _marker: PhantomData,
        }
    }
}

impl<I: GrainInterface> GrainProxy<I> {
    pub fn grain_id(&self) -> &GrainId {
        &self.grain
    }

    /// Invokes a method with the default timeout.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, CallError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_timeout(method, args, None).await
    }

    /// Invokes a method with an explicit timeout.
    pub async fn call_with_timeout<A, R>(
        &self,
        method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R, CallError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let blob = encode_value(args)
            .map_err(|e| CallError::InvalidArgument(e.to_string()))?;
        let payload = self
            .client
            .invoke_raw(&self.grain, &self.interface, method, blob, timeout)
            .await?;
        decode_value(&payload)
            .map_err(|e| CallError::Protocol(ProtocolError::Malformed(e.to_string())))
    }

    /// Fire-and-forget: no response, no pending entry.
    pub async fn notify<A: Serialize>(&self, method: &str, args: &A) -> Result<(), CallError> {
        let blob = encode_value(args)
            .map_err(|e| CallError::InvalidArgument(e.to_string()))?;
        self.client
            .invoke_one_way(&self.grain, &self.interface, method, blob)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grange_core::MethodOrdinal;

    struct Ping;

    impl GrainInterface for Ping {
        const INTERFACE_ID: &'static str = "game.Ping";
        const GRAIN_TYPE: &'static str = "Echo";
        const METHODS: &'static [&'static str] = &["ping", "pong"];
    }

    #[test]
    fn local_descriptor_sorts_methods() {
        let d = Ping::descriptor().unwrap();
        assert_eq!(d.ordinal_of("ping"), Some(MethodOrdinal(0)));
        assert_eq!(d.ordinal_of("pong"), Some(MethodOrdinal(1)));
    }

    #[tokio::test]
    async fn proxy_names_the_grain() {
        let client = GrainClient::new("c1", grange_core::RuntimeConfig::new());
        let proxy: GrainProxy<Ping> = client.get_grain("alice");
        assert_eq!(proxy.grain_id().grain_type(), "Echo");
        assert_eq!(proxy.grain_id().key(), "alice");
    }

    #[tokio::test]
    async fn call_without_connection_is_no_provider() {
        let client = GrainClient::new("c1", grange_core::RuntimeConfig::new());
        let proxy: GrainProxy<Ping> = client.get_grain("alice");
        let err = proxy
            .call::<(String,), (String,)>("ping", &("hi".to_string(),))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::NoProvider("game.Ping".to_string()));
    }
}
