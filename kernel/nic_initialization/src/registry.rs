//! Bookkeeping of the interfaces that have been brought up.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use spin::Mutex;
use crate::NicInterface;


/// Owns every [`NicInterface`] that is in use and hands out their device IDs.
///
/// IDs are assigned in increasing order and never reused.
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    next_id: u32,
    devices: BTreeMap<u32, Arc<NicInterface>>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry {
            inner: Mutex::new(RegistryInner { next_id: 0, devices: BTreeMap::new() }),
        }
    }

    /// Adds `nic` and returns its newly assigned ID.
    pub fn register(&self, nic: Arc<NicInterface>) -> u32 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.devices.insert(id, nic);
        info!("DeviceRegistry: registered NIC interface as device {}", id);
        id
    }

    pub fn get(&self, id: u32) -> Option<Arc<NicInterface>> {
        self.inner.lock().devices.get(&id).cloned()
    }

    /// Removes the device with the given ID and returns it, so the caller can shut it down.
    pub fn remove(&self, id: u32) -> Option<Arc<NicInterface>> {
        self.inner.lock().devices.remove(&id)
    }

    /// The IDs of all registered devices, in increasing order.
    pub fn ids(&self) -> Vec<u32> {
        self.inner.lock().devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().devices.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        DeviceRegistry::new()
    }
}
