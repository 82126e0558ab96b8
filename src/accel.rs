//! Accelerator device management.
//!
//! # Overview
//!
//! Operators never reach for a process-wide accelerator singleton. Callers
//! hand a [`DeviceManager`] to every call (through
//! [`ExecContext`](crate::template_offset::ExecContext)), which answers three
//! questions:
//!
//! - which device is current ([`DeviceManager::current_device`])
//! - whether that device is the host itself ([`DeviceManager::device_is_host`])
//! - where a host buffer lives on the device ([`DeviceManager::device_ptr`])
//!
//! # Memory Model
//!
//! A mirrored device keeps one device copy per host buffer, keyed by the host
//! address:
//!
//! ```text
//! host buffer ──create──> device copy
//!             <─update_host──
//!             ──update_device─>
//! ```
//!
//! Results computed on the device are only visible on the host after
//! [`DeviceManager::update_host`]. Buffers that were never created are mapped
//! for a single offloaded region: copied in on entry, and copied back on exit
//! when the region writes them.
//!
//! Without the `offload` feature a mirrored device shares host memory, and
//! the data movement calls do nothing.

use crate::template_offset::dispatch::OFFLOAD_BUILT;
use crate::template_offset::types::{Interval, OffsetError};
use std::borrow::Cow;
use std::collections::HashMap;
use std::mem::size_of;
use std::sync::{Mutex, MutexGuard};

/// Device identifier. [`DeviceId::HOST`] stands for the host itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(pub i32);

impl DeviceId {
    pub const HOST: DeviceId = DeviceId(-1);
}

/// Address of a buffer in device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// Base of the device address space handed out by mirrored devices.
const DEVICE_BASE: u64 = 0x1000;
/// Alignment of device allocations in bytes.
const DEVICE_ALIGN: u64 = 256;

// =============================================================================
// Device buffers
// =============================================================================

/// Typed storage of one device allocation.
#[derive(Debug)]
pub enum DeviceData {
    F64(Vec<f64>),
    U8(Vec<u8>),
    Intervals(Vec<Interval>),
}

/// Element types that can live in device memory.
pub trait DeviceElement: Copy + Send + Sync + 'static {
    const NAME: &'static str;

    fn wrap(data: Vec<Self>) -> DeviceData;
    fn view(data: &DeviceData) -> Option<&[Self]>;
    fn view_mut(data: &mut DeviceData) -> Option<&mut [Self]>;
    fn unwrap(data: DeviceData) -> Option<Vec<Self>>;
}

macro_rules! impl_device_element {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl DeviceElement for $ty {
            const NAME: &'static str = $name;

            fn wrap(data: Vec<Self>) -> DeviceData {
                DeviceData::$variant(data)
            }

            fn view(data: &DeviceData) -> Option<&[Self]> {
                match data {
                    DeviceData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn view_mut(data: &mut DeviceData) -> Option<&mut [Self]> {
                match data {
                    DeviceData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn unwrap(data: DeviceData) -> Option<Vec<Self>> {
                match data {
                    DeviceData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_device_element!(f64, F64, "float64");
impl_device_element!(u8, U8, "uint8");
impl_device_element!(Interval, Intervals, "interval");

#[derive(Debug)]
struct DeviceAlloc {
    ptr: DevicePtr,
    len: usize,
    data: DeviceData,
}

#[inline]
fn host_key<T>(host: &[T]) -> usize {
    host.as_ptr() as usize
}

// =============================================================================
// DeviceHeap
// =============================================================================

/// Device memory of a mirrored device.
#[derive(Debug)]
pub struct DeviceHeap {
    allocs: HashMap<usize, DeviceAlloc>,
    next_ptr: u64,
}

/// An output buffer checked out of the heap for the duration of a region.
#[derive(Debug)]
pub(crate) struct Checkout<T> {
    key: usize,
    /// Device address when the buffer is resident, None when mapped for this region only.
    resident: Option<DevicePtr>,
    pub data: Vec<T>,
}

impl DeviceHeap {
    fn new() -> Self {
        Self {
            allocs: HashMap::new(),
            next_ptr: DEVICE_BASE,
        }
    }

    fn alloc_ptr<T>(&mut self, len: usize) -> DevicePtr {
        let ptr = DevicePtr(self.next_ptr);
        let bytes = (len * size_of::<T>()).max(1) as u64;
        self.next_ptr += bytes.div_ceil(DEVICE_ALIGN) * DEVICE_ALIGN;
        ptr
    }

    fn resident<T: DeviceElement>(&self, host: &[T]) -> Result<Option<&DeviceAlloc>, OffsetError> {
        match self.allocs.get(&host_key(host)) {
            None => Ok(None),
            Some(alloc) if alloc.len == host.len() && T::view(&alloc.data).is_some() => {
                Ok(Some(alloc))
            }
            Some(alloc) => Err(OffsetError::Device(format!(
                "device buffer at {:#x} does not hold {} {} values",
                alloc.ptr.0,
                host.len(),
                T::NAME
            ))),
        }
    }

    /// Read-only device view of `host`: the resident copy, or a copy made for this region.
    pub(crate) fn resolve<'a, T: DeviceElement>(
        &'a self,
        host: &[T],
    ) -> Result<Cow<'a, [T]>, OffsetError> {
        match self.resident(host)? {
            Some(alloc) => {
                log::trace!("using resident {} buffer at {:#x}", T::NAME, alloc.ptr.0);
                // resident() checked the variant
                Ok(Cow::Borrowed(T::view(&alloc.data).unwrap_or_default()))
            }
            None => {
                log::trace!("mapping {} {} values to device", host.len(), T::NAME);
                Ok(Cow::Owned(host.to_vec()))
            }
        }
    }

    /// Take a writable device copy of `host` out of the heap.
    pub(crate) fn checkout<T: DeviceElement>(
        &mut self,
        host: &[T],
    ) -> Result<Checkout<T>, OffsetError> {
        let key = host_key(host);
        if self.resident(host)?.is_none() {
            log::trace!("mapping {} {} values to device", host.len(), T::NAME);
            return Ok(Checkout {
                key,
                resident: None,
                data: host.to_vec(),
            });
        }
        let alloc = self
            .allocs
            .remove(&key)
            .ok_or_else(|| OffsetError::Device("device buffer vanished".into()))?;
        let ptr = alloc.ptr;
        let data = T::unwrap(alloc.data)
            .ok_or_else(|| OffsetError::Device("device buffer changed type".into()))?;
        Ok(Checkout {
            key,
            resident: Some(ptr),
            data,
        })
    }

    /// Return a checked-out buffer. Resident buffers go back to the heap,
    /// region-mapped buffers are copied back to `host`.
    pub(crate) fn checkin<T: DeviceElement>(&mut self, checkout: Checkout<T>, host: &mut [T]) {
        match checkout.resident {
            Some(ptr) => {
                let len = checkout.data.len();
                self.allocs.insert(
                    checkout.key,
                    DeviceAlloc {
                        ptr,
                        len,
                        data: T::wrap(checkout.data),
                    },
                );
            }
            None => {
                log::trace!("copying {} {} values back to host", host.len(), T::NAME);
                host.copy_from_slice(&checkout.data);
            }
        }
    }
}

// =============================================================================
// DeviceManager
// =============================================================================

/// Explicit accelerator context passed to every operator call.
///
/// A manager without device memory behaves like the host device: data
/// movement calls succeed without doing anything, and a buffer's device
/// address is its host address.
#[derive(Debug)]
pub struct DeviceManager {
    device: DeviceId,
    /// None when the device shares host memory.
    heap: Option<Mutex<DeviceHeap>>,
}

impl DeviceManager {
    /// Manager whose current device is the host. Offload is never taken.
    pub const fn host() -> Self {
        Self {
            device: DeviceId::HOST,
            heap: None,
        }
    }

    /// Manager for a device with its own memory, mirrored from host buffers.
    ///
    /// Without the `offload` feature no operator can run on the device, so
    /// the device keeps its id but shares host memory.
    pub fn mirrored(device: DeviceId) -> Self {
        if OFFLOAD_BUILT {
            return Self::with_device_memory(device);
        }
        log::debug!(
            "offload support is not built; device {} shares host memory",
            device.0
        );
        Self { device, heap: None }
    }

    /// Manager for a device with its own memory, whether or not offload is built.
    pub(crate) fn with_device_memory(device: DeviceId) -> Self {
        Self {
            device,
            heap: Some(Mutex::new(DeviceHeap::new())),
        }
    }

    pub fn current_device(&self) -> DeviceId {
        self.device
    }

    pub fn device_is_host(&self) -> bool {
        self.heap.is_none()
    }

    /// Lock device memory for an offloaded region.
    pub(crate) fn lock_heap(&self) -> Result<MutexGuard<'_, DeviceHeap>, OffsetError> {
        let heap = self.heap.as_ref().ok_or_else(|| {
            OffsetError::Device(format!("device {} has no device memory", self.device.0))
        })?;
        heap.lock()
            .map_err(|_| OffsetError::Device("device memory lock poisoned".into()))
    }

    /// Device address of the mirror of `host`, if one exists.
    pub fn device_ptr<T: DeviceElement>(&self, host: &[T]) -> Option<DevicePtr> {
        if self.device_is_host() {
            return Some(DevicePtr(host_key(host) as u64));
        }
        let heap = self.lock_heap().ok()?;
        let alloc = heap.resident(host).ok()??;
        Some(alloc.ptr)
    }

    /// Whether `host` is addressable on the device.
    pub fn present<T: DeviceElement>(&self, host: &[T]) -> bool {
        self.device_ptr(host).is_some()
    }

    /// Number of buffers currently mirrored on the device.
    pub fn n_resident(&self) -> usize {
        match &self.heap {
            Some(_) => self.lock_heap().map(|heap| heap.allocs.len()).unwrap_or(0),
            None => 0,
        }
    }

    /// Allocate a device mirror of `host` and copy its contents over.
    pub fn create<T: DeviceElement>(&self, host: &[T]) -> Result<DevicePtr, OffsetError> {
        if self.device_is_host() {
            return Ok(DevicePtr(host_key(host) as u64));
        }
        let mut heap = self.lock_heap()?;
        let key = host_key(host);
        if heap.allocs.contains_key(&key) {
            return Err(OffsetError::Device(format!(
                "host buffer {key:#x} is already present on device {}",
                self.device.0
            )));
        }
        let ptr = heap.alloc_ptr::<T>(host.len());
        heap.allocs.insert(
            key,
            DeviceAlloc {
                ptr,
                len: host.len(),
                data: T::wrap(host.to_vec()),
            },
        );
        log::debug!(
            "created {} {} values at {:#x} on device {}",
            host.len(),
            T::NAME,
            ptr.0,
            self.device.0
        );
        Ok(ptr)
    }

    /// Copy host contents into the existing device mirror.
    pub fn update_device<T: DeviceElement>(&self, host: &[T]) -> Result<(), OffsetError> {
        if self.device_is_host() {
            return Ok(());
        }
        let mut heap = self.lock_heap()?;
        let alloc = resident_mut(&mut heap, host)?;
        T::view_mut(&mut alloc.data)
            .ok_or_else(|| OffsetError::Device("device buffer changed type".into()))?
            .copy_from_slice(host);
        Ok(())
    }

    /// Copy the device mirror back into `host`.
    pub fn update_host<T: DeviceElement>(&self, host: &mut [T]) -> Result<(), OffsetError> {
        if self.device_is_host() {
            return Ok(());
        }
        let mut heap = self.lock_heap()?;
        let alloc = resident_mut(&mut heap, host)?;
        let data = T::view(&alloc.data)
            .ok_or_else(|| OffsetError::Device("device buffer changed type".into()))?;
        host.copy_from_slice(data);
        Ok(())
    }

    /// Free the device mirror of `host`.
    pub fn delete<T: DeviceElement>(&self, host: &[T]) -> Result<(), OffsetError> {
        if self.device_is_host() {
            return Ok(());
        }
        let mut heap = self.lock_heap()?;
        heap.resident(host)?
            .ok_or_else(|| not_present(host_key(host), self.device))?;
        heap.allocs.remove(&host_key(host));
        Ok(())
    }
}

fn not_present(key: usize, device: DeviceId) -> OffsetError {
    OffsetError::Device(format!(
        "host buffer {key:#x} is not present on device {}",
        device.0
    ))
}

fn resident_mut<'h, T: DeviceElement>(
    heap: &'h mut DeviceHeap,
    host: &[T],
) -> Result<&'h mut DeviceAlloc, OffsetError> {
    heap.resident(host)?
        .ok_or_else(|| OffsetError::Device(format!("host buffer {:#x} is not present", host_key(host))))?;
    heap.allocs
        .get_mut(&host_key(host))
        .ok_or_else(|| OffsetError::Device("device buffer vanished".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_manager() {
        let mgr = DeviceManager::host();
        assert!(mgr.device_is_host());
        assert_eq!(mgr.current_device(), DeviceId::HOST);
        let mut buf = vec![1.0f64, 2.0];
        let host_addr = DevicePtr(buf.as_ptr() as u64);

        // data movement is a no-op on the host
        assert_eq!(mgr.create(&buf), Ok(host_addr));
        assert_eq!(mgr.device_ptr(&buf), Some(host_addr));
        assert!(mgr.present(&buf));
        buf[0] = 3.0;
        mgr.update_host(&mut buf).unwrap();
        assert_eq!(buf, vec![3.0, 2.0]);
        mgr.update_device(&buf).unwrap();
        mgr.delete(&buf).unwrap();
        assert_eq!(mgr.n_resident(), 0);
    }

    #[test]
    fn test_mirrored_shares_host_memory_without_offload() {
        let mgr = DeviceManager::mirrored(DeviceId(3));
        assert_eq!(mgr.current_device(), DeviceId(3));
        assert_eq!(mgr.device_is_host(), !OFFLOAD_BUILT);

        let mut buf = vec![1.0f64, 2.0];
        mgr.create(&buf).unwrap();
        buf[1] = 9.0;
        if OFFLOAD_BUILT {
            mgr.update_host(&mut buf).unwrap();
            assert_eq!(buf, vec![1.0, 2.0]);
            assert_eq!(mgr.n_resident(), 1);
        } else {
            // nothing stale can be copied back over host results
            mgr.update_host(&mut buf).unwrap();
            assert_eq!(buf, vec![1.0, 9.0]);
            assert_eq!(mgr.n_resident(), 0);
        }
        mgr.delete(&buf).unwrap();
    }

    #[test]
    fn test_create_and_resolve() {
        let mgr = DeviceManager::with_device_memory(DeviceId(0));
        assert!(!mgr.device_is_host());

        let a = vec![1.0f64, 2.0, 3.0];
        let b = vec![1u8; 10];
        let pa = mgr.create(&a).unwrap();
        let pb = mgr.create(&b).unwrap();
        assert_ne!(pa, pb);
        assert_eq!(pa.0 % DEVICE_ALIGN, 0);
        assert_eq!(pb.0 % DEVICE_ALIGN, 0);
        assert_eq!(mgr.device_ptr(&a), Some(pa));
        assert!(mgr.present(&b));
        assert_eq!(mgr.n_resident(), 2);

        // creating twice is an error
        assert!(mgr.create(&a).is_err());
    }

    #[test]
    fn test_update_roundtrip() {
        let mgr = DeviceManager::with_device_memory(DeviceId(1));
        let mut host = vec![1.0f64, 2.0];
        mgr.create(&host).unwrap();

        host[0] = 10.0;
        // device still holds the old value until update_device
        let mut on_device = host.clone();
        {
            let heap = mgr.lock_heap().unwrap();
            let view = heap.resolve(&host).unwrap();
            on_device.copy_from_slice(&view);
        }
        assert_eq!(on_device, vec![1.0, 2.0]);

        mgr.update_device(&host).unwrap();
        host[0] = -1.0;
        mgr.update_host(&mut host).unwrap();
        assert_eq!(host, vec![10.0, 2.0]);

        mgr.delete(&host).unwrap();
        assert!(!mgr.present(&host));
        assert!(mgr.update_host(&mut host).is_err());
        assert!(mgr.delete(&host).is_err());
    }

    #[test]
    fn test_checkout_checkin() {
        let mgr = DeviceManager::with_device_memory(DeviceId(0));
        let mut resident = vec![0.0f64; 3];
        let mut transient = vec![0.0f64; 3];
        mgr.create(&resident).unwrap();

        {
            let mut heap = mgr.lock_heap().unwrap();
            let mut r = heap.checkout(&resident).unwrap();
            let mut t = heap.checkout(&transient).unwrap();
            r.data[0] = 5.0;
            t.data[0] = 7.0;
            heap.checkin(r, &mut resident);
            heap.checkin(t, &mut transient);
        }

        // resident results stay on the device
        assert_eq!(resident[0], 0.0);
        assert_eq!(transient[0], 7.0);
        mgr.update_host(&mut resident).unwrap();
        assert_eq!(resident[0], 5.0);
        assert_eq!(mgr.n_resident(), 1);
    }
}
