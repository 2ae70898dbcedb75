use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Minimal service container handed to grain factories.
///
/// Construction and wiring are separate phases: the host assembles values
/// here first, then the runtime borrows the finished container at every
/// activation, so grains and the runtime never hold owning pointers to
/// each other.
#[derive(Default)]
pub struct ServiceContainer {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a value by its type, replacing any previous one.
    pub fn provide<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// Looks up a value by type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|any| any.clone().downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
