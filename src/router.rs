//! Data router: demultiplexes point-cloud and IMU datagrams to
//! user-installed callbacks and observers (spec §4.9).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::handle::DeviceHandle;
use crate::ports::FamilyTag;

pub type PointCloudCallback = Arc<dyn Fn(DeviceHandle, FamilyTag, &[u8]) + Send + Sync>;
pub type ImuCallback = Arc<dyn Fn(DeviceHandle, FamilyTag, &[u8]) + Send + Sync>;

/// Opaque handle returned when installing an observer, used to remove it
/// later (spec §4.9: "a unique short ID for later removal").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Which channel a datagram arrived on, decided purely by destination port
/// (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    PointCloud,
    Imu,
}

#[derive(Default)]
struct Callbacks {
    point_cloud: HashMap<FamilyTag, PointCloudCallback>,
    imu: HashMap<FamilyTag, ImuCallback>,
    observers: HashMap<ObserverId, PointCloudCallback>,
}

/// Routes opaque point-cloud/IMU payloads to whatever user code has
/// registered interest, tagged by `(handle, device_type)` (spec §4.9). The
/// payload itself is never interpreted — point-cloud contents are strictly
/// out of scope (spec §1 non-goals).
pub struct DataRouter {
    callbacks: RwLock<Callbacks>,
    next_observer_id: AtomicU64,
}

impl Default for DataRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl DataRouter {
    #[must_use]
    pub fn new() -> Self {
        Self { callbacks: RwLock::new(Callbacks::default()), next_observer_id: AtomicU64::new(1) }
    }

    pub fn set_point_cloud_callback(&self, device_type: FamilyTag, callback: PointCloudCallback) {
        self.callbacks.write().unwrap().point_cloud.insert(device_type, callback);
    }

    pub fn set_imu_callback(&self, device_type: FamilyTag, callback: ImuCallback) {
        self.callbacks.write().unwrap().imu.insert(device_type, callback);
    }

    /// Installs an additional point-cloud observer, returning an id that
    /// can later be passed to [`Self::remove_observer`].
    pub fn add_point_cloud_observer(&self, callback: PointCloudCallback) -> ObserverId {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().unwrap().observers.insert(id, callback);
        id
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.callbacks.write().unwrap().observers.remove(&id);
    }

    /// Dispatches a datagram decided to be `channel` traffic for `handle`.
    pub fn route(&self, channel: Channel, handle: DeviceHandle, device_type: FamilyTag, payload: &[u8]) {
        let callbacks = self.callbacks.read().unwrap();
        match channel {
            Channel::PointCloud => {
                if let Some(cb) = callbacks.point_cloud.get(&device_type) {
                    cb(handle, device_type, payload);
                }
                for observer in callbacks.observers.values() {
                    observer(handle, device_type, payload);
                }
            }
            Channel::Imu => {
                if let Some(cb) = callbacks.imu.get(&device_type) {
                    cb(handle, device_type, payload);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn handle() -> DeviceHandle {
        DeviceHandle::from_ipv4(Ipv4Addr::new(192, 168, 1, 101))
    }

    #[test]
    fn routes_point_cloud_to_registered_callback_and_observers() {
        let router = DataRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = Arc::clone(&hits);
        router.set_point_cloud_callback(FamilyTag::B, Arc::new(move |_, _, _| {
            cb_hits.fetch_add(1, Ordering::Relaxed);
        }));
        let obs_hits = Arc::clone(&hits);
        let id = router.add_point_cloud_observer(Arc::new(move |_, _, _| {
            obs_hits.fetch_add(1, Ordering::Relaxed);
        }));

        router.route(Channel::PointCloud, handle(), FamilyTag::B, &[1, 2, 3]);
        assert_eq!(hits.load(Ordering::Relaxed), 2);

        router.remove_observer(id);
        router.route(Channel::PointCloud, handle(), FamilyTag::B, &[1, 2, 3]);
        assert_eq!(hits.load(Ordering::Relaxed), 3); // callback fires again, observer doesn't
    }

    #[test]
    fn imu_callback_is_keyed_by_device_type() {
        let router = DataRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = Arc::clone(&hits);
        router.set_imu_callback(FamilyTag::A, Arc::new(move |_, _, _| {
            cb_hits.fetch_add(1, Ordering::Relaxed);
        }));
        router.route(Channel::Imu, handle(), FamilyTag::B, &[9]);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        router.route(Channel::Imu, handle(), FamilyTag::A, &[9]);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
