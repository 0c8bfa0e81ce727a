use crate::backend::{BufferDesc, BufferDevice, BufferUsage};

use super::error::SimError;

/// Generational reference into a [`DeviceBufferPool`]. A handle stays invalid
/// once released, even after its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    /// Sentinel for "no buffer bound". Never valid in any pool.
    pub const UNBOUND: Self = Self {
        index: u32::MAX,
        generation: u32::MAX,
    };

    pub fn is_unbound(self) -> bool {
        self == Self::UNBOUND
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub label: String,
    pub count: u32,
    pub stride_bytes: u64,
    pub usage: BufferUsage,
}

impl BufferInfo {
    pub fn size_bytes(&self) -> u64 {
        u64::from(self.count) * self.stride_bytes
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<(T, BufferInfo)>,
}

/// Owns every device buffer the simulation allocates. Buffers have a fixed
/// record count and stride for their whole lifetime; resizing means release
/// and allocate again.
pub struct DeviceBufferPool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for DeviceBufferPool<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> DeviceBufferPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate<D>(
        &mut self,
        device: &mut D,
        label: &str,
        count: u32,
        stride_bytes: u64,
        usage: BufferUsage,
    ) -> Result<BufferHandle, SimError>
    where
        D: BufferDevice<Buffer = T>,
    {
        if count == 0 {
            return Err(SimError::allocation(label, "zero record count"));
        }
        if stride_bytes == 0 {
            return Err(SimError::allocation(label, "zero record stride"));
        }
        let size_bytes = u64::from(count)
            .checked_mul(stride_bytes)
            .ok_or_else(|| SimError::allocation(label, "size overflows u64"))?;
        let max = device.max_buffer_size();
        if size_bytes > max {
            return Err(SimError::allocation(
                label,
                format!("{size_bytes} bytes exceeds device maximum of {max}"),
            ));
        }

        let buffer = device.create_buffer(&BufferDesc {
            label,
            size_bytes,
            usage,
        })?;
        let info = BufferInfo {
            label: label.to_owned(),
            count,
            stride_bytes,
            usage,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some((buffer, info));
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some((buffer, info)),
                });
                (self.slots.len() - 1) as u32
            }
        };
        let handle = BufferHandle {
            index,
            generation: self.slots[index as usize].generation,
        };
        log::debug!("allocated {label}: {count} x {stride_bytes} bytes as {handle:?}");
        Ok(handle)
    }

    /// Releases a buffer back to the device. Releasing the same handle twice
    /// is reported as [`SimError::InvalidHandle`].
    pub fn release<D>(&mut self, device: &mut D, handle: BufferHandle) -> Result<(), SimError>
    where
        D: BufferDevice<Buffer = T>,
    {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(SimError::InvalidHandle(handle))?;
        let (buffer, info) = slot.entry.take().ok_or(SimError::InvalidHandle(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        device.destroy_buffer(buffer);
        log::debug!("released {} ({handle:?})", info.label);
        Ok(())
    }

    pub fn get(&self, handle: BufferHandle) -> Result<&T, SimError> {
        self.entry(handle).map(|(buffer, _)| buffer)
    }

    pub fn info(&self, handle: BufferHandle) -> Result<&BufferInfo, SimError> {
        self.entry(handle).map(|(_, info)| info)
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.entry(handle).is_ok()
    }

    pub fn live_handles(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|_| BufferHandle {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn live_bytes(&self) -> u64 {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .map(|(_, info)| info.size_bytes())
            .sum()
    }

    fn entry(&self, handle: BufferHandle) -> Result<&(T, BufferInfo), SimError> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(SimError::InvalidHandle(handle))
    }
}
