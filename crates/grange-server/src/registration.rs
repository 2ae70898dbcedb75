use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_core::future::BoxFuture;
use grange_core::{CallError, GrainId, InterfaceId, MethodOrdinal};
use grange_registry::{InterfaceDescriptor, RegistryError};
use grange_wire::{decode_value, encode_value};
use serde::{Serialize, de::DeserializeOwned};

use crate::{PolicyRule, ResolvedPolicy, ServiceContainer};

/// Type-erased live grain instance.
pub type GrainInstance = Arc<dyn Any + Send + Sync>;

/// Ordinal-indexed method handler: decodes the argument blob, awaits the
/// method, encodes the result.
pub type RawHandler = Arc<
    dyn Fn(GrainInstance, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, CallError>>
        + Send
        + Sync,
>;

pub(crate) type GrainFactory = Arc<
    dyn Fn(&GrainId, &ServiceContainer) -> Result<(GrainInstance, Arc<dyn Grain>), CallError>
        + Send
        + Sync,
>;

/// Lifecycle hooks for grain implementations. Both default to no-ops.
pub trait Grain: Send + Sync + 'static {
    /// Runs once per activation, before the first method call.
    fn on_activate(&self) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(std::future::ready(Ok(())))
    }

    /// Runs when the activation is evicted.
    fn on_deactivate(&self) -> BoxFuture<'_, ()> {
        Box::pin(std::future::ready(()))
    }
}

struct MethodRegistration {
    name: String,
    policy: Vec<PolicyRule>,
    handler: RawHandler,
}

struct InterfaceRegistration {
    interface_id: String,
    policy: Vec<PolicyRule>,
    methods: Vec<MethodRegistration>,
}

/// Declares one grain type: its constructor, properties, implemented
/// interfaces with typed method handlers, and declarative policies at
/// every level.
pub struct GrainTypeRegistration<T: Grain> {
    grain_type: String,
    properties: BTreeMap<String, String>,
    factory: GrainFactory,
    class_policy: Vec<PolicyRule>,
    interfaces: Vec<InterfaceRegistration>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Grain> GrainTypeRegistration<T> {
    pub fn new<F>(grain_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&GrainId, &ServiceContainer) -> Result<Arc<T>, CallError> + Send + Sync + 'static,
    {
        let factory: GrainFactory = Arc::new(move |id, services| {
            let grain = factory(id, services)?;
            Ok((grain.clone() as GrainInstance, grain as Arc<dyn Grain>))
        });
        GrainTypeRegistration {
            grain_type: grain_type.into(),
            properties: BTreeMap::new(),
            factory,
            class_policy: Vec::new(),
            interfaces: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Attaches a manifest property advertised to clients.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Attaches a class-level policy rule.
    pub fn policy(mut self, rule: PolicyRule) -> Self {
        self.class_policy.push(rule);
        self
    }

    /// Opens an interface block for method registration.
    pub fn interface(&mut self, interface_id: impl Into<String>) -> InterfaceBuilder<'_, T> {
        self.interfaces.push(InterfaceRegistration {
            interface_id: interface_id.into(),
            policy: Vec::new(),
            methods: Vec::new(),
        });
        let last = self.interfaces.len() - 1;
        InterfaceBuilder {
            target: &mut self.interfaces[last],
            _marker: PhantomData,
        }
    }

    pub(crate) fn build(self) -> Result<GrainTypeEntry, RegistryError> {
        let mut interfaces = Vec::with_capacity(self.interfaces.len());
        for mut registration in self.interfaces {
            let descriptor = Arc::new(InterfaceDescriptor::new(
                &registration.interface_id,
                registration.methods.iter().map(|m| m.name.clone()),
            )?);

            // Ordinals follow byte-wise name order; aligning the handler
            // table is one sort away.
            registration.methods.sort_by(|a, b| a.name.cmp(&b.name));

            let mut handlers = Vec::with_capacity(registration.methods.len());
            let mut policies = Vec::with_capacity(registration.methods.len());
            for method in &registration.methods {
                handlers.push(method.handler.clone());
                policies.push(ResolvedPolicy::resolve(
                    &self.class_policy,
                    &registration.policy,
                    &method.policy,
                ));
            }

            interfaces.push((
                descriptor.interface_id().clone(),
                Arc::new(InterfaceTable {
                    descriptor,
                    handlers,
                    policies,
                }),
            ));
        }

        Ok(GrainTypeEntry {
            grain_type: self.grain_type,
            properties: self.properties,
            factory: self.factory,
            interfaces,
        })
    }
}

/// Registers methods and policies on one interface of a grain type.
pub struct InterfaceBuilder<'a, T: Grain> {
    target: &'a mut InterfaceRegistration,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Grain> InterfaceBuilder<'a, T> {
    /// Attaches an interface-level policy rule.
    pub fn policy(self, rule: PolicyRule) -> Self {
        self.target.policy.push(rule);
        self
    }

    /// Registers a method handler.
    pub fn method<A, R, Fut, F>(self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R, CallError>> + Send + 'static,
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
    {
        self.method_with_policy(name, &[], f)
    }

    /// Registers a method handler with method-level policy rules.
    pub fn method_with_policy<A, R, Fut, F>(
        self,
        name: impl Into<String>,
        policy: &[PolicyRule],
        f: F,
    ) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R, CallError>> + Send + 'static,
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
    {
        self.target.methods.push(MethodRegistration {
            name: name.into(),
            policy: policy.to_vec(),
            handler: wrap_handler::<T, A, R, Fut, F>(f),
        });
        self
    }
}

fn wrap_handler<T, A, R, Fut, F>(f: F) -> RawHandler
where
    T: Grain,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, CallError>> + Send + 'static,
    F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
{
    Arc::new(move |instance: GrainInstance, blob: Vec<u8>| {
        let grain = match instance.downcast::<T>() {
            Ok(grain) => grain,
            Err(_) => {
                return Box::pin(std::future::ready(Err(CallError::Internal(
                    "activation instance type mismatch".into(),
                )))) as BoxFuture<'static, Result<Vec<u8>, CallError>>;
            }
        };
        let args: A = match decode_value(&blob) {
            Ok(args) => args,
            Err(e) => {
                return Box::pin(std::future::ready(Err(CallError::InvalidArgument(
                    e.to_string(),
                ))));
            }
        };
        let fut = f(grain, args);
        Box::pin(async move {
            let value = fut.await?;
            encode_value(&value)
                .map_err(|e| CallError::Internal(format!("result encoding failed: {}", e)))
        })
    })
}

/// Frozen per-interface dispatch table: ordinal-indexed handlers and
/// their resolved policies.
pub struct InterfaceTable {
    descriptor: Arc<InterfaceDescriptor>,
    handlers: Vec<RawHandler>,
    policies: Vec<ResolvedPolicy>,
}

impl InterfaceTable {
    pub fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        &self.descriptor
    }

    pub fn handler(&self, ordinal: MethodOrdinal) -> Option<&RawHandler> {
        self.handlers.get(ordinal.0 as usize)
    }

    pub fn policy(&self, ordinal: MethodOrdinal) -> Option<&ResolvedPolicy> {
        self.policies.get(ordinal.0 as usize)
    }
}

/// Frozen per-type entry: factory plus all interface tables.
pub struct GrainTypeEntry {
    grain_type: String,
    properties: BTreeMap<String, String>,
    pub(crate) factory: GrainFactory,
    interfaces: Vec<(InterfaceId, Arc<InterfaceTable>)>,
}

impl GrainTypeEntry {
    pub fn grain_type(&self) -> &str {
        &self.grain_type
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn interfaces(&self) -> impl Iterator<Item = (&InterfaceId, &Arc<InterfaceTable>)> {
        self.interfaces.iter().map(|(id, table)| (id, table))
    }
}
