/* Driver registry (§4.2): three-tier dispatch over (brand, device_type, model), generalized
 * from the teacher's flat `create_driver(name)` match into a keyed, registerable table. */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::domain::{DeviceType, GENERIC_BRAND, MODEL_WILDCARD};
use crate::driver::{DeviceDriver, DriverFactory};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistryKey {
    brand: String,
    device_type: DeviceType,
    model: String,
}

impl RegistryKey {
    fn new(brand: &str, device_type: DeviceType, model: &str) -> Self {
        Self {
            brand: brand.to_string(),
            device_type,
            model: model.to_string(),
        }
    }
}

/// Registered driver factories, looked up by `(brand, device_type, model)`.
///
/// Dispatch order (§4.2):
/// 1. Exact `(brand, device_type, model)` match.
/// 2. `(brand, device_type, "*")` — any model of this brand/type.
/// 3. `(GENERIC, device_type, "*")` or `(GENERIC, device_type, model)` — the
///    type-level fallback driver, if one was registered.
pub struct DriverRegistry {
    drivers: RwLock<HashMap<RegistryKey, Arc<dyn DriverFactory>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory for `(brand, device_type, model)`. `model` may be
    /// [`MODEL_WILDCARD`] to match any model of that brand/type, or `brand`
    /// may be [`GENERIC_BRAND`] to register a type-level fallback.
    pub fn register(&self, brand: &str, device_type: DeviceType, model: &str, factory: Arc<dyn DriverFactory>) {
        let key = RegistryKey::new(brand, device_type, model);
        self.drivers.write().expect("registry lock poisoned").insert(key, factory);
    }

    /// Resolve a driver for the given identity, walking the three dispatch
    /// tiers in order. Returns `None` if nothing matches.
    pub fn resolve(&self, brand: &str, device_type: DeviceType, model: &str) -> Option<Box<dyn DeviceDriver>> {
        let drivers = self.drivers.read().expect("registry lock poisoned");

        if let Some(f) = drivers.get(&RegistryKey::new(brand, device_type, model)) {
            return Some(f.create());
        }
        if let Some(f) = drivers.get(&RegistryKey::new(brand, device_type, MODEL_WILDCARD)) {
            return Some(f.create());
        }
        if let Some(f) = drivers.get(&RegistryKey::new(GENERIC_BRAND, device_type, model)) {
            return Some(f.create());
        }
        if let Some(f) = drivers.get(&RegistryKey::new(GENERIC_BRAND, device_type, MODEL_WILDCARD)) {
            return Some(f.create());
        }

        warn!("no driver registered for brand={brand} type={device_type:?} model={model}");
        None
    }

    /// `IsSupported` (§4.2): true if any of the three dispatch tiers would
    /// resolve, without actually constructing a driver.
    pub fn is_supported(&self, brand: &str, device_type: DeviceType, model: &str) -> bool {
        let drivers = self.drivers.read().expect("registry lock poisoned");
        drivers.contains_key(&RegistryKey::new(brand, device_type, model))
            || drivers.contains_key(&RegistryKey::new(brand, device_type, MODEL_WILDCARD))
            || drivers.contains_key(&RegistryKey::new(GENERIC_BRAND, device_type, model))
            || drivers.contains_key(&RegistryKey::new(GENERIC_BRAND, device_type, MODEL_WILDCARD))
    }

    /// `ListDrivers`: every registered `(brand, device_type, model)` key.
    pub fn list_drivers(&self) -> Vec<(String, DeviceType, String)> {
        self.drivers
            .read()
            .expect("registry lock poisoned")
            .keys()
            .map(|k| (k.brand.clone(), k.device_type, k.model.clone()))
            .collect()
    }

    /// `SupportedBrands`: distinct brand names across all registered keys,
    /// excluding the reserved [`GENERIC_BRAND`].
    pub fn supported_brands(&self) -> Vec<String> {
        let drivers = self.drivers.read().expect("registry lock poisoned");
        let mut brands: Vec<String> = drivers
            .keys()
            .map(|k| k.brand.clone())
            .filter(|b| b != GENERIC_BRAND)
            .collect();
        brands.sort();
        brands.dedup();
        brands
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
