// Error taxonomy and status codes
//
// Every registry operation reports failure through `GpuError`. Callers that
// need a flat numeric code (FFI layers, tools) use `GpuError::status()`,
// and `Status::message()` for human readable text.

use ash::vk;
use thiserror::Error;

/// Registry result type
pub type Result<T, E = GpuError> = std::result::Result<T, E>;

/// Everything that can go wrong inside the registry.
///
/// Validation kinds are raised before any backend call is made. Only
/// `GpuFault` is fatal: it forces the frame cycle into `Faulted`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GpuError {
    #[error("invalid {kind} handle {raw:#010x}")]
    InvalidHandle { kind: &'static str, raw: u32 },

    #[error("registry is already initialized; call close() first")]
    AlreadyInitialized,

    #[error("registry is not initialized")]
    NotInitialized,

    #[error("unsupported extensions: {0:?}")]
    UnsupportedExtension(Vec<String>),

    #[error("unsupported layers: {0:?}")]
    UnsupportedLayer(Vec<String>),

    #[error("unsupported device features: {0:?}")]
    UnsupportedFeature(Vec<&'static str>),

    #[error("queue family {family}: {count} queues requested but {priorities} priorities given")]
    PriorityCountMismatch { family: u32, count: u32, priorities: usize },

    #[error("queue family {family}: priority {value} outside [0, 1]")]
    InvalidPriority { family: u32, value: f32 },

    #[error("queue family {family}: {requested} queues requested, {available} available")]
    QueueFamilyExhausted { family: u32, requested: u32, available: u32 },

    #[error("no memory type matches bits {type_bits:#x} with flags {flags:?}")]
    NoCompatibleMemoryType { type_bits: u32, flags: vk::MemoryPropertyFlags },

    #[error("out of memory")]
    OutOfMemory,

    #[error("view {index} creation failed: {result}")]
    ViewCreationFailed { index: usize, result: vk::Result },

    #[error("unknown shader handle {0:#010x}")]
    UnknownShaderHandle(u32),

    #[error("shader range [{start}, {end}) is invalid for a bulk of {len}")]
    InvalidShaderRange { start: u32, end: u32, len: usize },

    #[error("resource not ready: {0}")]
    ResourceNotReady(String),

    #[error("frame slot {slot} still has a dispatch in flight")]
    DispatchInFlight { slot: usize },

    #[error("gather of frame slot {slot} timed out")]
    GatherTimeout { slot: usize },

    #[error("GPU fault: device lost")]
    GpuFault,

    #[error("no surface provider registered")]
    NoSurfaceProvider,

    #[error("{kind} is still referenced by {refs} dependents")]
    StillReferenced { kind: &'static str, refs: u32 },

    #[error("invalid phase: expected {expected}, found {found}")]
    InvalidPhase { expected: &'static str, found: &'static str },

    #[error("{0} handle space exhausted")]
    HandleSpaceExhausted(&'static str),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("registry is not quiescent")]
    NotQuiescent,

    #[error("backend error: {0}")]
    Backend(vk::Result),
}

impl GpuError {
    /// Closed numeric code for this error
    pub fn status(&self) -> Status {
        match self {
            GpuError::InvalidHandle { .. } => Status::InvalidHandle,
            GpuError::AlreadyInitialized => Status::AlreadyInitialized,
            GpuError::NotInitialized => Status::NotInitialized,
            GpuError::UnsupportedExtension(_) => Status::UnsupportedExtension,
            GpuError::UnsupportedLayer(_) => Status::UnsupportedLayer,
            GpuError::UnsupportedFeature(_) => Status::UnsupportedFeature,
            GpuError::PriorityCountMismatch { .. } => Status::PriorityCountMismatch,
            GpuError::InvalidPriority { .. } => Status::InvalidPriority,
            GpuError::QueueFamilyExhausted { .. } => Status::QueueFamilyExhausted,
            GpuError::NoCompatibleMemoryType { .. } => Status::NoCompatibleMemoryType,
            GpuError::OutOfMemory => Status::OutOfMemory,
            GpuError::ViewCreationFailed { .. } => Status::ViewCreationFailed,
            GpuError::UnknownShaderHandle(_) => Status::UnknownShaderHandle,
            GpuError::InvalidShaderRange { .. } => Status::InvalidShaderRange,
            GpuError::ResourceNotReady(_) => Status::ResourceNotReady,
            GpuError::DispatchInFlight { .. } => Status::DispatchInFlight,
            GpuError::GatherTimeout { .. } => Status::GatherTimeout,
            GpuError::GpuFault => Status::GpuFault,
            GpuError::NoSurfaceProvider => Status::NoSurfaceProvider,
            GpuError::StillReferenced { .. } => Status::StillReferenced,
            GpuError::InvalidPhase { .. } => Status::InvalidPhase,
            GpuError::HandleSpaceExhausted(_) => Status::HandleSpaceExhausted,
            GpuError::InvalidParameter(_) => Status::InvalidParameter,
            GpuError::NotQuiescent => Status::NotQuiescent,
            GpuError::Backend(_) => Status::Bad,
        }
    }

    /// Whether the error leaves the registry unusable until `close()`
    pub fn is_fatal(&self) -> bool {
        matches!(self, GpuError::GpuFault)
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => GpuError::GpuFault,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                GpuError::OutOfMemory
            }
            // The registry checks names before creation; these carry no list
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => GpuError::UnsupportedExtension(Vec::new()),
            vk::Result::ERROR_LAYER_NOT_PRESENT => GpuError::UnsupportedLayer(Vec::new()),
            vk::Result::ERROR_FEATURE_NOT_PRESENT => GpuError::UnsupportedFeature(Vec::new()),
            other => GpuError::Backend(other),
        }
    }
}

/// Flat status codes returned at the public boundary.
///
/// `Good` and `Bad` keep their historical values 0 and 1.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Good = 0,
    Bad = 1,
    InvalidHandle = 2,
    AlreadyInitialized = 3,
    NotInitialized = 4,
    UnsupportedExtension = 5,
    UnsupportedLayer = 6,
    UnsupportedFeature = 7,
    PriorityCountMismatch = 8,
    InvalidPriority = 9,
    QueueFamilyExhausted = 10,
    NoCompatibleMemoryType = 11,
    OutOfMemory = 12,
    ViewCreationFailed = 13,
    UnknownShaderHandle = 14,
    InvalidShaderRange = 15,
    ResourceNotReady = 16,
    DispatchInFlight = 17,
    GatherTimeout = 18,
    GpuFault = 19,
    NoSurfaceProvider = 20,
    StillReferenced = 21,
    InvalidPhase = 22,
    HandleSpaceExhausted = 23,
    InvalidParameter = 24,
    NotQuiescent = 25,
}

impl Status {
    const ALL: [Status; 26] = [
        Status::Good,
        Status::Bad,
        Status::InvalidHandle,
        Status::AlreadyInitialized,
        Status::NotInitialized,
        Status::UnsupportedExtension,
        Status::UnsupportedLayer,
        Status::UnsupportedFeature,
        Status::PriorityCountMismatch,
        Status::InvalidPriority,
        Status::QueueFamilyExhausted,
        Status::NoCompatibleMemoryType,
        Status::OutOfMemory,
        Status::ViewCreationFailed,
        Status::UnknownShaderHandle,
        Status::InvalidShaderRange,
        Status::ResourceNotReady,
        Status::DispatchInFlight,
        Status::GatherTimeout,
        Status::GpuFault,
        Status::NoSurfaceProvider,
        Status::StillReferenced,
        Status::InvalidPhase,
        Status::HandleSpaceExhausted,
        Status::InvalidParameter,
        Status::NotQuiescent,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Status> {
        Status::ALL.get(code as usize).copied()
    }

    /// Status of an operation result
    pub fn of<T>(result: &Result<T>) -> Status {
        match result {
            Ok(_) => Status::Good,
            Err(e) => e.status(),
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Status::Good => "Good, move on.",
            Status::Bad => "Something went wrong, message not set.",
            Status::InvalidHandle => "Handle does not name a live object of this kind.",
            Status::AlreadyInitialized => "Registry already initialized; close it first.",
            Status::NotInitialized => "Registry has no instance yet.",
            Status::UnsupportedExtension => "A requested extension is not available.",
            Status::UnsupportedLayer => "A requested layer is not available.",
            Status::UnsupportedFeature => "A requested device feature is not supported.",
            Status::PriorityCountMismatch => "Queue priority count differs from queue count.",
            Status::InvalidPriority => "Queue priority outside [0, 1].",
            Status::QueueFamilyExhausted => "More queues requested than the family offers.",
            Status::NoCompatibleMemoryType => "No memory type satisfies the requested flags.",
            Status::OutOfMemory => "Memory allocation failed.",
            Status::ViewCreationFailed => "A view could not be created; resource rolled back.",
            Status::UnknownShaderHandle => "Superseded shader handle is unknown.",
            Status::InvalidShaderRange => "Stage declaration range is invalid.",
            Status::ResourceNotReady => "Pending work references a resource that is not usable.",
            Status::DispatchInFlight => "Frame slot still has a dispatch in flight.",
            Status::GatherTimeout => "Gather timed out; the submission is still in flight.",
            Status::GpuFault => "Device lost; close and reinitialize.",
            Status::NoSurfaceProvider => "No surface provider registered.",
            Status::StillReferenced => "Object is still referenced by dependents.",
            Status::InvalidPhase => "Frame phase called out of order.",
            Status::HandleSpaceExhausted => "No handles left for this kind.",
            Status::InvalidParameter => "Invalid parameter.",
            Status::NotQuiescent => "Registry is busy; retry between frames.",
        }
    }
}

/// Message for a raw status code; unknown codes read as `Bad`
pub fn message_for_code(code: u16) -> &'static str {
    Status::from_code(code).unwrap_or(Status::Bad).message()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_table() {
        for (index, status) in Status::ALL.iter().enumerate() {
            assert_eq!(status.code() as usize, index);
            assert_eq!(Status::from_code(status.code()), Some(*status));
        }
    }

    #[test]
    fn out_of_range_codes_read_as_bad() {
        let last = Status::ALL.len() as u16;
        assert_eq!(message_for_code(last), Status::Bad.message());
        assert_eq!(message_for_code(u16::MAX), Status::Bad.message());
        assert_eq!(message_for_code(0), "Good, move on.");
    }

    #[test]
    fn device_lost_is_the_only_fatal_translation() {
        assert_eq!(GpuError::from(vk::Result::ERROR_DEVICE_LOST), GpuError::GpuFault);
        assert!(GpuError::GpuFault.is_fatal());
        assert_eq!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GpuError::OutOfMemory
        );
        assert!(!GpuError::OutOfMemory.is_fatal());
        assert_eq!(GpuError::from(vk::Result::ERROR_UNKNOWN).status(), Status::Bad);
    }

    #[test]
    fn status_of_result() {
        let ok: Result<()> = Ok(());
        assert_eq!(Status::of(&ok), Status::Good);
        let err: Result<()> = Err(GpuError::NoSurfaceProvider);
        assert_eq!(Status::of(&err).code(), 20);
    }
}
