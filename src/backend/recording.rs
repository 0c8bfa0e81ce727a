use std::collections::{BTreeMap, HashMap};

use super::{BufferDesc, BufferDevice, ComputeBackend, KernelId, RenderBackend, Scalar};
use crate::particles::error::SimError;
use crate::particles::pipeline::StepKind;
use crate::particles::render::DrawBounds;

/// Host-side stand-in for a device buffer. Only its identity and size are
/// tracked.
#[derive(Debug, PartialEq, Eq)]
pub struct HostBuffer {
    id: u64,
    size_bytes: u64,
}

impl HostBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateBuffer {
        id: u64,
        label: String,
        size_bytes: u64,
    },
    DestroyBuffer {
        id: u64,
    },
    SetBuffer {
        kernel: KernelId,
        binding: String,
        buffer: u64,
    },
    SetScalar {
        name: String,
        value: Scalar,
    },
    SetVector {
        name: String,
        value: [f32; 4],
    },
    Dispatch {
        kernel: KernelId,
        groups: [u32; 3],
        /// Buffer ids bound to the kernel at the moment of dispatch.
        bindings: BTreeMap<String, u64>,
    },
    Draw {
        positions: u64,
        instances: u32,
        bounds: DrawBounds,
    },
}

#[derive(Debug, Clone)]
struct RecordedKernel {
    name: String,
    workgroup_size: Option<[u32; 3]>,
    bound: BTreeMap<String, u64>,
}

/// Device that lives entirely in host memory and records every command it
/// receives. Allocation limits and out-of-memory can be configured to
/// exercise failure paths.
#[derive(Debug)]
pub struct RecordingBackend {
    available: Vec<(String, Option<[u32; 3]>)>,
    kernels: Vec<RecordedKernel>,
    live: HashMap<u64, u64>,
    commands: Vec<Command>,
    next_id: u64,
    max_buffer_size: u64,
    memory_budget: Option<u64>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new(StepKind::ALL.iter().map(|kind| kind.kernel_name()))
    }
}

impl RecordingBackend {
    pub fn new<I, S>(kernel_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            available: kernel_names.into_iter().map(|n| (n.into(), None)).collect(),
            kernels: Vec::new(),
            live: HashMap::new(),
            commands: Vec::new(),
            next_id: 0,
            max_buffer_size: 256 << 20,
            memory_budget: None,
        }
    }

    pub fn with_max_buffer_size(mut self, bytes: u64) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    /// Total live bytes the device can hold before allocations fail.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Declares a workgroup size for a kernel so activation can verify it.
    pub fn with_workgroup_size(mut self, kernel: &str, size: [u32; 3]) -> Self {
        for (name, workgroup) in &mut self.available {
            if name == kernel {
                *workgroup = Some(size);
            }
        }
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn live_buffers(&self) -> usize {
        self.live.len()
    }

    pub fn live_bytes(&self) -> u64 {
        self.live.values().sum()
    }

    pub fn kernel_name(&self, kernel: KernelId) -> Option<&str> {
        self.kernels.get(kernel.0 as usize).map(|k| k.name.as_str())
    }

    /// `(kernel name, bindings)` for every dispatch, in issue order.
    pub fn dispatch_log(&self) -> Vec<(String, BTreeMap<String, u64>)> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                Command::Dispatch {
                    kernel, bindings, ..
                } => Some((
                    self.kernel_name(*kernel).unwrap_or("?").to_owned(),
                    bindings.clone(),
                )),
                _ => None,
            })
            .collect()
    }

    /// Most recent value written to a program uniform.
    pub fn last_scalar(&self, name: &str) -> Option<Scalar> {
        self.commands.iter().rev().find_map(|command| match command {
            Command::SetScalar { name: n, value } if n == name => Some(*value),
            _ => None,
        })
    }

    pub fn draws(&self) -> impl Iterator<Item = (u64, u32, DrawBounds)> + '_ {
        self.commands.iter().filter_map(|command| match command {
            Command::Draw {
                positions,
                instances,
                bounds,
            } => Some((*positions, *instances, *bounds)),
            _ => None,
        })
    }

    fn kernel(&self, kernel: KernelId) -> Result<&RecordedKernel, SimError> {
        self.kernels
            .get(kernel.0 as usize)
            .ok_or_else(|| SimError::KernelNotFound(format!("#{}", kernel.0)))
    }
}

impl BufferDevice for RecordingBackend {
    type Buffer = HostBuffer;

    fn max_buffer_size(&self) -> u64 {
        self.max_buffer_size
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<HostBuffer, SimError> {
        if let Some(budget) = self.memory_budget {
            if self.live_bytes() + desc.size_bytes > budget {
                return Err(SimError::allocation(desc.label, "device out of memory"));
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, desc.size_bytes);
        self.commands.push(Command::CreateBuffer {
            id,
            label: desc.label.to_owned(),
            size_bytes: desc.size_bytes,
        });
        Ok(HostBuffer {
            id,
            size_bytes: desc.size_bytes,
        })
    }

    fn destroy_buffer(&mut self, buffer: HostBuffer) {
        if self.live.remove(&buffer.id).is_none() {
            log::error!("destroying unknown host buffer {}", buffer.id);
        }
        self.commands.push(Command::DestroyBuffer { id: buffer.id });
    }
}

impl ComputeBackend for RecordingBackend {
    fn find_kernel(&mut self, name: &str) -> Result<KernelId, SimError> {
        if let Some(index) = self.kernels.iter().position(|k| k.name == name) {
            return Ok(KernelId(index as u32));
        }
        let (_, workgroup_size) = self
            .available
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| SimError::KernelNotFound(name.to_owned()))?;
        self.kernels.push(RecordedKernel {
            name: name.to_owned(),
            workgroup_size: *workgroup_size,
            bound: BTreeMap::new(),
        });
        Ok(KernelId(self.kernels.len() as u32 - 1))
    }

    fn kernel_workgroup_size(&self, kernel: KernelId) -> Option<[u32; 3]> {
        self.kernels
            .get(kernel.0 as usize)
            .and_then(|k| k.workgroup_size)
    }

    fn set_buffer(
        &mut self,
        kernel: KernelId,
        binding: &str,
        buffer: &HostBuffer,
    ) -> Result<(), SimError> {
        if !self.live.contains_key(&buffer.id) {
            return Err(SimError::UnboundBinding {
                kernel: self.kernel(kernel)?.name.clone(),
                binding: binding.to_owned(),
            });
        }
        let slot = self
            .kernels
            .get_mut(kernel.0 as usize)
            .ok_or_else(|| SimError::KernelNotFound(format!("#{}", kernel.0)))?;
        slot.bound.insert(binding.to_owned(), buffer.id);
        self.commands.push(Command::SetBuffer {
            kernel,
            binding: binding.to_owned(),
            buffer: buffer.id,
        });
        Ok(())
    }

    fn set_scalar(&mut self, name: &str, value: Scalar) {
        self.commands.push(Command::SetScalar {
            name: name.to_owned(),
            value,
        });
    }

    fn set_vector(&mut self, name: &str, value: [f32; 4]) {
        self.commands.push(Command::SetVector {
            name: name.to_owned(),
            value,
        });
    }

    fn dispatch(&mut self, kernel: KernelId, groups: [u32; 3]) -> Result<(), SimError> {
        let bindings = self.kernel(kernel)?.bound.clone();
        self.commands.push(Command::Dispatch {
            kernel,
            groups,
            bindings,
        });
        Ok(())
    }
}

impl RenderBackend for RecordingBackend {
    fn draw_instanced(&mut self, positions: &HostBuffer, instance_count: u32, bounds: DrawBounds) {
        self.commands.push(Command::Draw {
            positions: positions.id,
            instances: instance_count,
            bounds,
        });
    }
}
