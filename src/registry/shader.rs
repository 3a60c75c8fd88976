// Shaders and pipelines
//
// Shaders arrive in bulk: an ordered list of binaries plus stage
// declarations that cover it with [start, end) ranges. A binary that names
// an `existing_shader` replaces it: every pipeline built from the old
// shader switches to the new one and is marked stale. Stale pipelines are
// rebuilt on next use, never eagerly.

use super::{Registry, Retired};
use crate::backend::{Backend, PipelineKind, StageDesc};
use crate::error::{GpuError, Result};
use crate::handle::*;
use ash::vk;
use std::collections::HashSet;
use std::ffi::CString;

/// One shader binary in a bulk submission
#[derive(Debug, Clone, Copy)]
pub struct ShaderInfo<'a> {
    /// SPIR-V words
    pub bytecode: &'a [u32],
    /// Shader this one supersedes, or `NULL`
    pub existing_shader: ShaderHandle,
}

impl<'a> ShaderInfo<'a> {
    pub fn new(bytecode: &'a [u32]) -> Self {
        Self {
            bytecode,
            existing_shader: ShaderHandle::NULL,
        }
    }

    pub fn replacing(bytecode: &'a [u32], existing_shader: ShaderHandle) -> Self {
        Self {
            bytecode,
            existing_shader,
        }
    }

    /// Length in bytes
    pub fn code_size(&self) -> usize {
        std::mem::size_of_val(self.bytecode)
    }
}

/// Stage, device and entry point for shaders `start..end` of a bulk
#[derive(Debug, Clone)]
pub struct StageDecl {
    pub start: u32,
    pub end: u32,
    pub device: DeviceHandle,
    pub stage: vk::ShaderStageFlags,
    pub entry: String,
}

#[derive(Debug, Clone, Default)]
pub struct ShaderBulk<'a> {
    pub shader_infos: Vec<ShaderInfo<'a>>,
    pub declares: Vec<StageDecl>,
}

pub struct ShaderRecord<B: Backend> {
    pub device: DeviceHandle,
    pub stage: vk::ShaderStageFlags,
    pub entry: CString,
    pub bytecode: Vec<u32>,
    pub native: B::ShaderModule,
    /// Shader this one superseded
    pub replaces: ShaderHandle,
    /// Shader that superseded this one
    pub replaced_by: ShaderHandle,
}

impl<B: Backend> ShaderRecord<B> {
    pub fn code_size(&self) -> usize {
        std::mem::size_of_val(self.bytecode.as_slice())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub device: DeviceHandle,
    pub kind: PipelineKind,
    pub shaders: Vec<ShaderHandle>,
}

pub struct PipelineRecord<B: Backend> {
    pub device: DeviceHandle,
    pub kind: PipelineKind,
    pub shaders: Vec<ShaderHandle>,
    pub native: B::Pipeline,
    /// A shader was replaced since `native` was built
    pub stale: bool,
    pub rebuilds: u32,
}

impl<B: Backend> Registry<B> {
    /// Register one shader with entry point `main`
    pub fn add_shader(
        &mut self,
        info: ShaderInfo<'_>,
        device: DeviceHandle,
        stage: vk::ShaderStageFlags,
    ) -> Result<ShaderHandle> {
        let bulk = ShaderBulk {
            shader_infos: vec![info],
            declares: vec![StageDecl {
                start: 0,
                end: 1,
                device,
                stage,
                entry: "main".to_string(),
            }],
        };
        let handles = self.add_shaders(&bulk)?;
        handles
            .first()
            .copied()
            .ok_or_else(|| GpuError::InvalidParameter("empty shader bulk".into()))
    }

    /// Register every shader of a bulk; all or nothing.
    ///
    /// Returns one handle per binary, in bulk order.
    pub fn add_shaders(&mut self, bulk: &ShaderBulk<'_>) -> Result<Vec<ShaderHandle>> {
        self.require_instance()?;
        let len = bulk.shader_infos.len();
        if len == 0 {
            return Err(GpuError::InvalidParameter("empty shader bulk".into()));
        }

        // Every binary must be covered by exactly one declaration
        let mut owner: Vec<Option<usize>> = vec![None; len];
        let mut entries = Vec::with_capacity(bulk.declares.len());
        for (decl_index, decl) in bulk.declares.iter().enumerate() {
            if decl.start >= decl.end || decl.end as usize > len {
                return Err(GpuError::InvalidShaderRange {
                    start: decl.start,
                    end: decl.end,
                    len,
                });
            }
            self.devices.resolve(decl.device)?;
            let entry = CString::new(decl.entry.as_str()).map_err(|_| {
                GpuError::InvalidParameter(format!("entry point {:?} contains NUL", decl.entry))
            })?;
            entries.push(entry);

            for index in decl.start as usize..decl.end as usize {
                if owner[index].replace(decl_index).is_some() {
                    return Err(GpuError::InvalidParameter(format!(
                        "shader {} is covered by more than one stage declaration",
                        index
                    )));
                }
            }
        }
        let owner: Vec<usize> = owner
            .iter()
            .enumerate()
            .map(|(index, decl)| {
                decl.ok_or_else(|| {
                    GpuError::InvalidParameter(format!("shader {} has no stage declaration", index))
                })
            })
            .collect::<Result<_>>()?;

        let mut superseded = HashSet::new();
        for (index, info) in bulk.shader_infos.iter().enumerate() {
            if info.bytecode.is_empty() {
                return Err(GpuError::InvalidParameter(format!("shader {} is empty", index)));
            }
            if info.existing_shader.is_null() {
                continue;
            }
            let old = self
                .shaders
                .resolve(info.existing_shader)
                .map_err(|_| GpuError::UnknownShaderHandle(info.existing_shader.raw()))?;
            let decl = &bulk.declares[owner[index]];
            if old.stage != decl.stage || old.device != decl.device {
                return Err(GpuError::InvalidParameter(format!(
                    "replacement for {:?} must keep its stage and device",
                    info.existing_shader
                )));
            }
            if !old.replaced_by.is_null() || !superseded.insert(info.existing_shader) {
                return Err(GpuError::InvalidParameter(format!(
                    "{:?} is already replaced",
                    info.existing_shader
                )));
            }
        }
        self.shaders.reserve(len)?;

        let mut modules = Vec::with_capacity(len);
        for (index, info) in bulk.shader_infos.iter().enumerate() {
            let device = &self.devices.resolve(bulk.declares[owner[index]].device)?.native;
            match self.backend.create_shader_module(device, info.bytecode) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for (created, module) in modules.into_iter().enumerate() {
                        let device =
                            &self.devices.resolve(bulk.declares[owner[created]].device)?.native;
                        self.backend.destroy_shader_module(device, module);
                    }
                    log::error!("Shader {} of bulk failed to compile: {}", index, e);
                    return Err(self.frames.backend_err(e));
                }
            }
        }

        let mut handles = Vec::with_capacity(len);
        for ((info, module), &decl_index) in bulk.shader_infos.iter().zip(modules).zip(&owner) {
            let decl = &bulk.declares[decl_index];
            let handle = self.shaders.allocate(ShaderRecord {
                device: decl.device,
                stage: decl.stage,
                entry: entries[decl_index].clone(),
                bytecode: info.bytecode.to_vec(),
                native: module,
                replaces: info.existing_shader,
                replaced_by: ShaderHandle::NULL,
            })?;
            self.devices.retain(decl.device)?;
            handles.push(handle);
        }

        for (info, &handle) in bulk.shader_infos.iter().zip(&handles) {
            if !info.existing_shader.is_null() {
                self.supersede(info.existing_shader, handle)?;
            }
        }

        log::info!(
            "Registered {} shader(s) in {} stage declaration(s)",
            len,
            bulk.declares.len()
        );
        Ok(handles)
    }

    /// Move every pipeline built on `old` over to `new` and mark it stale
    fn supersede(&mut self, old: ShaderHandle, new: ShaderHandle) -> Result<()> {
        let mut moved = 0u32;
        for (_, pipeline) in self.pipelines.iter_mut() {
            for shader in pipeline.shaders.iter_mut().filter(|shader| **shader == old) {
                *shader = new;
                pipeline.stale = true;
                moved += 1;
            }
        }
        for _ in 0..moved {
            self.shaders.unretain(old)?;
            self.shaders.retain(new)?;
        }

        self.shaders.resolve_mut(old)?.replaced_by = new;
        log::info!(
            "{:?} replaced by {:?}; {} pipeline stage(s) marked stale",
            old,
            new,
            moved
        );
        Ok(())
    }

    pub fn shader(&self, shader: ShaderHandle) -> Result<&ShaderRecord<B>> {
        self.shaders.resolve(shader)
    }

    /// Destroy a shader no pipeline is built on
    pub fn destroy_shader(&mut self, shader: ShaderHandle) -> Result<()> {
        let record = self.shaders.release(shader)?;
        let device = &self.devices.resolve(record.device)?.native;
        self.backend.destroy_shader_module(device, record.native);
        self.devices.unretain(record.device)?;

        // Forget the link from the shader it replaced
        if let Ok(old) = self.shaders.resolve_mut(record.replaces) {
            if old.replaced_by == shader {
                old.replaced_by = ShaderHandle::NULL;
            }
        }
        log::debug!("Destroyed {:?}", shader);
        Ok(())
    }

    fn build_pipeline(
        &mut self,
        device: DeviceHandle,
        kind: PipelineKind,
        shaders: &[ShaderHandle],
    ) -> Result<B::Pipeline> {
        let records = shaders
            .iter()
            .map(|&shader| self.shaders.resolve(shader))
            .collect::<Result<Vec<_>>>()?;
        let stages: Vec<StageDesc<'_, B::ShaderModule>> = records
            .iter()
            .map(|shader| StageDesc {
                module: &shader.native,
                stage: shader.stage,
                entry: shader.entry.as_c_str(),
            })
            .collect();
        let device = &self.devices.resolve(device)?.native;
        self.backend
            .create_pipeline(device, kind, &stages)
            .map_err(|e| self.frames.backend_err(e))
    }

    /// Build a pipeline from registered shaders
    pub fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        self.devices.resolve(desc.device)?;
        if desc.shaders.is_empty() {
            return Err(GpuError::InvalidParameter("pipeline has no shaders".into()));
        }
        for &shader in &desc.shaders {
            let record = self.shaders.resolve(shader)?;
            if record.device != desc.device {
                return Err(GpuError::InvalidParameter(format!(
                    "{:?} lives on {:?}, not {:?}",
                    shader, record.device, desc.device
                )));
            }
        }
        self.pipelines.reserve(1)?;

        let native = self.build_pipeline(desc.device, desc.kind, &desc.shaders)?;
        let handle = self.pipelines.allocate(PipelineRecord {
            device: desc.device,
            kind: desc.kind,
            shaders: desc.shaders.clone(),
            native,
            stale: false,
            rebuilds: 0,
        })?;
        self.devices.retain(desc.device)?;
        for &shader in &desc.shaders {
            self.shaders.retain(shader)?;
        }

        log::info!(
            "Created {:?} ({:?}, {} stage(s))",
            handle,
            desc.kind,
            desc.shaders.len()
        );
        Ok(handle)
    }

    /// Rebuild a stale pipeline from its current shaders.
    ///
    /// On failure the pipeline keeps its previous native object and stays
    /// stale. The replaced native object is retired until in-flight work
    /// that may use it has been gathered.
    pub(super) fn rebuild_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        let (device, kind, shaders) = {
            let record = self.pipelines.resolve(pipeline)?;
            (record.device, record.kind, record.shaders.clone())
        };

        let native = self.build_pipeline(device, kind, &shaders)?;
        let record = self.pipelines.resolve_mut(pipeline)?;
        let old = std::mem::replace(&mut record.native, native);
        record.stale = false;
        record.rebuilds += 1;
        self.retire(device, Retired::Pipeline(old))?;

        log::info!("Rebuilt stale {:?}", pipeline);
        Ok(())
    }

    /// Native pipeline, rebuilding it first if a shader was replaced
    pub fn use_pipeline(&mut self, pipeline: PipelineHandle) -> Result<&B::Pipeline> {
        if self.pipelines.resolve(pipeline)?.stale {
            self.rebuild_pipeline(pipeline)?;
        }
        Ok(&self.pipelines.resolve(pipeline)?.native)
    }

    pub fn pipeline(&self, pipeline: PipelineHandle) -> Result<&PipelineRecord<B>> {
        self.pipelines.resolve(pipeline)
    }

    pub fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        let record = self.pipelines.release(pipeline)?;
        for &shader in &record.shaders {
            self.shaders.unretain(shader)?;
        }
        self.retire(record.device, Retired::Pipeline(record.native))?;
        self.devices.unretain(record.device)?;
        log::debug!("Destroyed {:?}", pipeline);
        Ok(())
    }
}
