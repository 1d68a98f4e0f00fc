use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tabrelay_common::element::{ElementDescriptor, NodeHandle};

/// Name -> descriptor map shared by every instruction of one context.
///
/// Last write wins on a name collision. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct ElementRegistry {
    elements: Arc<Mutex<HashMap<String, ElementDescriptor>>>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ElementDescriptor>> {
        self.elements.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a descriptor by name.
    pub fn upsert(&self, descriptor: ElementDescriptor) {
        self.lock().insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<ElementDescriptor> {
        self.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<ElementDescriptor> {
        self.lock().remove(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Write back the cache state of a resolution attempt.
    pub fn set_cached_handle(&self, name: &str, handle: Option<NodeHandle>) {
        if let Some(descriptor) = self.lock().get_mut(name) {
            match handle {
                Some(h) => descriptor.cache_handle(h),
                None => descriptor.invalidate(),
            }
        }
    }

    /// Clear the cached handle so the next access re-resolves.
    pub fn refresh(&self, name: &str) {
        self.set_cached_handle(name, None);
    }

    /// Clear every cached handle, e.g. after the document navigated.
    pub fn refresh_all(&self) {
        for descriptor in self.lock().values_mut() {
            descriptor.invalidate();
        }
    }

    pub fn store_text(&self, name: &str, text: impl Into<String>) {
        if let Some(descriptor) = self.lock().get_mut(name) {
            descriptor.extracted_text = Some(text.into());
        }
    }

    /// All descriptors, sorted by name.
    pub fn export(&self) -> Vec<ElementDescriptor> {
        let mut all: Vec<ElementDescriptor> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
