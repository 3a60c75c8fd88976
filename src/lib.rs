// =============================================================================
// VK-REGISTRY - handle registry and frame cycle over an explicit graphics API
// =============================================================================
//
// Callers name GPU objects through small typed handles instead of native
// object references. One `Registry` owns every native object, tracks who
// depends on what, and drives the update / dispatch / gather frame cycle.
//
// LAYERS:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Registry (handles, records, dependency refs, frame cycle)      │
// │    └── Backend trait (one call per native operation)            │
// │          ├── VulkanBackend (ash)                                │
// │          └── HeadlessBackend (software, fault injection)        │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod handle;
pub mod registry;

pub use backend::{Backend, HeadlessBackend, VulkanBackend};
pub use config::Config;
pub use error::{message_for_code, GpuError, Result, Status};
pub use handle::{
    BufferHandle, CommandPoolHandle, DeviceHandle, Handle, ImageHandle, InstanceHandle,
    MemoryHandle, MemoryInfoHandle, PhysicalDeviceHandle, PipelineHandle, QueueHandle,
    ShaderHandle, SwapchainHandle,
};
pub use registry::{
    Command, FrameState, GatherReport, Registry, ResourceRef, SharedRegistry, UpdateContext,
};
