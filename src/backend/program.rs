//! Reflection over WGSL kernel programs.
//!
//! Kernels, their bindings and the uniform block are looked up by name the
//! way a host binds them, so the module is parsed and validated with `naga`
//! up front and everything the backend needs is recorded here.

use std::collections::HashMap;

use thiserror::Error;

use super::Scalar;

pub const SPH_PROGRAM_SOURCE: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/particles_sph.wgsl"));
pub const WAVE_PROGRAM_SOURCE: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/particles_wave.wgsl"));

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("failed to parse WGSL program `{label}`:\n{message}")]
    Parse { label: String, message: String },
    #[error("WGSL program `{label}` failed validation: {message}")]
    Validate { label: String, message: String },
    #[error("binding `{name}` in program `{label}` is outside bind group 0")]
    UnsupportedGroup { label: String, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Uniform,
    Storage { read_only: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub name: String,
    pub binding: u32,
    pub kind: BindingKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    F32,
    U32,
    I32,
    Vec3F32,
    Vec4F32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformField {
    pub offset: u32,
    pub kind: FieldKind,
}

/// The program's `var<uniform>` struct, member by member.
#[derive(Debug, Clone, Default)]
pub struct UniformBlock {
    pub name: String,
    pub binding: u32,
    pub size: u32,
    pub fields: HashMap<String, UniformField>,
}

impl UniformBlock {
    /// Writes `value` into `staging` at the named member, converting to the
    /// member's declared type. Returns `false` if no such member exists.
    pub fn write_scalar(&self, staging: &mut [u8], name: &str, value: Scalar) -> bool {
        let Some(field) = self.fields.get(name) else {
            return false;
        };
        let bytes = match field.kind {
            FieldKind::F32 => value.as_f32().to_ne_bytes(),
            FieldKind::U32 => value.as_u32().to_ne_bytes(),
            FieldKind::I32 => value.as_i32().to_ne_bytes(),
            FieldKind::Vec3F32 | FieldKind::Vec4F32 => {
                log::warn!("uniform `{name}` is a vector; scalar write ignored");
                return false;
            }
        };
        write_at(staging, field.offset, &bytes)
    }

    pub fn write_vector(&self, staging: &mut [u8], name: &str, value: [f32; 4]) -> bool {
        let Some(field) = self.fields.get(name) else {
            return false;
        };
        let len = match field.kind {
            FieldKind::Vec3F32 => 3,
            FieldKind::Vec4F32 => 4,
            _ => {
                log::warn!("uniform `{name}` is a scalar; vector write ignored");
                return false;
            }
        };
        write_at(staging, field.offset, bytemuck::cast_slice(&value[..len]))
    }
}

fn write_at(staging: &mut [u8], offset: u32, bytes: &[u8]) -> bool {
    let start = offset as usize;
    match staging.get_mut(start..start + bytes.len()) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            true
        }
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedKernel {
    pub name: String,
    pub workgroup_size: [u32; 3],
    /// Only the bindings this entry point actually uses.
    pub bindings: Vec<ReflectedBinding>,
}

impl ReflectedKernel {
    pub fn binding(&self, name: &str) -> Option<&ReflectedBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }
}

/// A parsed and validated WGSL module with its compute kernels reflected.
#[derive(Debug, Clone)]
pub struct KernelProgram {
    label: String,
    source: String,
    kernels: Vec<ReflectedKernel>,
    uniform: Option<UniformBlock>,
}

impl KernelProgram {
    pub fn from_wgsl(label: &str, source: &str) -> Result<Self, ProgramError> {
        let module =
            naga::front::wgsl::parse_str(source).map_err(|err| ProgramError::Parse {
                label: label.to_owned(),
                message: err.emit_to_string(source),
            })?;
        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|err| ProgramError::Validate {
            label: label.to_owned(),
            message: err.into_inner().to_string(),
        })?;

        let mut globals = Vec::new();
        let mut uniform = None;
        for (handle, var) in module.global_variables.iter() {
            let Some(resource) = var.binding.as_ref() else {
                continue;
            };
            let name = var
                .name
                .clone()
                .unwrap_or_else(|| format!("binding{}", resource.binding));
            if resource.group != 0 {
                return Err(ProgramError::UnsupportedGroup {
                    label: label.to_owned(),
                    name,
                });
            }
            let kind = match var.space {
                naga::AddressSpace::Uniform => {
                    uniform = Some(reflect_uniform(&module, var, &name, resource.binding));
                    BindingKind::Uniform
                }
                naga::AddressSpace::Storage { access } => BindingKind::Storage {
                    read_only: !access.contains(naga::StorageAccess::STORE),
                },
                _ => continue,
            };
            globals.push((
                handle,
                ReflectedBinding {
                    name,
                    binding: resource.binding,
                    kind,
                },
            ));
        }

        let kernels = module
            .entry_points
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.stage == naga::ShaderStage::Compute)
            .map(|(index, entry)| {
                let usage = info.get_entry_point(index);
                ReflectedKernel {
                    name: entry.name.clone(),
                    workgroup_size: entry.workgroup_size,
                    bindings: globals
                        .iter()
                        .filter(|(handle, _)| !usage[*handle].is_empty())
                        .map(|(_, binding)| binding.clone())
                        .collect(),
                }
            })
            .collect();

        Ok(Self {
            label: label.to_owned(),
            source: source.to_owned(),
            kernels,
            uniform,
        })
    }

    /// `integrate` and `compute_density` over a linear layout.
    pub fn builtin_sph() -> Result<Self, ProgramError> {
        Self::from_wgsl("particles_sph", SPH_PROGRAM_SOURCE)
    }

    /// `wave` over a grid layout.
    pub fn builtin_wave() -> Result<Self, ProgramError> {
        Self::from_wgsl("particles_wave", WAVE_PROGRAM_SOURCE)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kernels(&self) -> &[ReflectedKernel] {
        &self.kernels
    }

    pub fn kernel(&self, name: &str) -> Option<&ReflectedKernel> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn uniform(&self) -> Option<&UniformBlock> {
        self.uniform.as_ref()
    }
}

fn reflect_uniform(
    module: &naga::Module,
    var: &naga::GlobalVariable,
    name: &str,
    binding: u32,
) -> UniformBlock {
    let mut block = UniformBlock {
        name: name.to_owned(),
        binding,
        ..UniformBlock::default()
    };
    if let naga::TypeInner::Struct { members, span } = &module.types[var.ty].inner {
        block.size = *span;
        for member in members {
            let Some(member_name) = member.name.as_ref() else {
                continue;
            };
            match field_kind(&module.types[member.ty].inner) {
                Some(kind) => {
                    block.fields.insert(
                        member_name.clone(),
                        UniformField {
                            offset: member.offset,
                            kind,
                        },
                    );
                }
                None => log::debug!("uniform member `{member_name}` has no host setter"),
            }
        }
    }
    block
}

fn field_kind(inner: &naga::TypeInner) -> Option<FieldKind> {
    use naga::{ScalarKind, TypeInner, VectorSize};

    match *inner {
        TypeInner::Scalar(scalar) if scalar.width == 4 => match scalar.kind {
            ScalarKind::Float => Some(FieldKind::F32),
            ScalarKind::Uint => Some(FieldKind::U32),
            ScalarKind::Sint => Some(FieldKind::I32),
            _ => None,
        },
        TypeInner::Vector {
            size: VectorSize::Tri,
            scalar,
        } if scalar.kind == ScalarKind::Float && scalar.width == 4 => Some(FieldKind::Vec3F32),
        TypeInner::Vector {
            size: VectorSize::Quad,
            scalar,
        } if scalar.kind == ScalarKind::Float && scalar.width == 4 => Some(FieldKind::Vec4F32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{BindingKind, FieldKind, KernelProgram, ProgramError};
    use crate::backend::Scalar;
    use crate::particles::compute::ParticleWorkgroup;
    use crate::particles::pipeline::{POSITIONS_BINDING, READ_BINDING, WRITE_BINDING};

    #[test]
    fn sph_program_exposes_both_kernels() {
        let program = KernelProgram::builtin_sph().unwrap();
        let integrate = program.kernel("integrate").unwrap();
        let density = program.kernel("compute_density").unwrap();

        assert_eq!(integrate.workgroup_size, ParticleWorkgroup::LINEAR.as_array());
        assert_eq!(density.workgroup_size, ParticleWorkgroup::LINEAR.as_array());

        assert_eq!(
            integrate.binding(READ_BINDING).unwrap().kind,
            BindingKind::Storage { read_only: true }
        );
        assert_eq!(
            integrate.binding(WRITE_BINDING).unwrap().kind,
            BindingKind::Storage { read_only: false }
        );
        assert!(integrate.binding(POSITIONS_BINDING).is_some());
        assert!(density.binding(POSITIONS_BINDING).is_none());
    }

    #[test]
    fn wave_program_uses_grid_workgroups() {
        let program = KernelProgram::builtin_wave().unwrap();
        let wave = program.kernel("wave").unwrap();
        assert_eq!(wave.workgroup_size, ParticleWorkgroup::GRID.as_array());
        assert!(wave.binding(POSITIONS_BINDING).is_some());
    }

    #[test]
    fn uniform_members_are_reflected_with_offsets() {
        let program = KernelProgram::builtin_sph().unwrap();
        let uniform = program.uniform().unwrap();
        assert_eq!(uniform.fields["particle_count"].offset, 0);
        assert_eq!(uniform.fields["particle_count"].kind, FieldKind::U32);
        assert_eq!(uniform.fields["domain"].kind, FieldKind::Vec4F32);
        assert_eq!(uniform.size % 16, 0);

        let mut staging = vec![0u8; uniform.size as usize];
        assert!(uniform.write_scalar(&mut staging, "time_step", Scalar::F32(0.5)));
        let offset = uniform.fields["time_step"].offset as usize;
        assert_eq!(&staging[offset..offset + 4], &0.5f32.to_ne_bytes());
        assert!(!uniform.write_scalar(&mut staging, "no_such_member", Scalar::U32(1)));
    }

    #[test]
    fn invalid_source_is_a_parse_error() {
        let err = KernelProgram::from_wgsl("broken", "fn oops( {").unwrap_err();
        assert!(matches!(err, ProgramError::Parse { .. }));
    }
}
