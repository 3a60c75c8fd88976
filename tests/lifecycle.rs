// Full registry lifecycles against the headless backend

use ash::vk;
use std::time::Duration;
use vk_registry::backend::headless::{FailPoint, HeadlessInstance, ObjectKind};
use vk_registry::backend::{BufferDesc, PipelineKind, SwapchainDesc};
use vk_registry::registry::{
    BufferInfo, LogicalDeviceInfo, PipelineDesc, QueueDecl, ShaderBulk, ShaderInfo, StageDecl,
};
use vk_registry::{
    message_for_code, BufferHandle, Command, DeviceHandle, FrameState, GpuError, HeadlessBackend,
    QueueHandle, Registry, ResourceRef, ShaderHandle, SharedRegistry, Status,
};

const VERTEX_SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];
const FRAGMENT_SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 2, 0];
const COMPUTE_SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 3, 0];
const TIMEOUT: Duration = Duration::from_millis(10);

fn single_queue() -> LogicalDeviceInfo {
    LogicalDeviceInfo {
        queues: vec![QueueDecl::new(0, vec![1.0])],
        ..LogicalDeviceInfo::default()
    }
}

fn init(registry: &mut Registry<HeadlessBackend>) -> (DeviceHandle, QueueHandle) {
    registry.default_init().unwrap();
    let physical = registry.preferred_physical_device().unwrap();
    let queues = registry.init_queues(&single_queue(), physical).unwrap();
    registry.init_frames(queues.device, queues.queues[0]).unwrap();
    (queues.device, queues.queues[0])
}

fn host_buffer(registry: &mut Registry<HeadlessBackend>, device: DeviceHandle) -> BufferHandle {
    let desc = BufferDesc::new(
        256,
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
    );
    let flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    registry
        .create_buffer(&BufferInfo::new(device, desc, flags))
        .unwrap()
}

fn compute_shader(registry: &mut Registry<HeadlessBackend>, device: DeviceHandle) -> ShaderHandle {
    registry
        .add_shader(
            ShaderInfo::new(&COMPUTE_SPIRV),
            device,
            vk::ShaderStageFlags::COMPUTE,
        )
        .unwrap()
}

fn dispatch_empty_frame(registry: &mut Registry<HeadlessBackend>) -> vk_registry::Result<u64> {
    registry.pre_update()?;
    registry.do_update(|_| Ok(()))?;
    registry.post_update()?;
    registry.async_dispatch()
}

#[test]
fn end_to_end() {
    let mut registry = Registry::new(HeadlessBackend::default());

    // Instance
    let instance = registry.default_init();
    assert_eq!(Status::of(&instance), Status::Good);

    // One queue of family 0
    let physical = registry.preferred_physical_device().unwrap();
    let queues = registry.init_queues(&single_queue(), physical).unwrap();
    assert_eq!(queues.queues.len(), 1);
    let device = queues.device;
    assert_eq!(registry.queue(queues.queues[0]).unwrap().device, device);

    // Host-visible buffer with its own memory
    let buffer = host_buffer(&mut registry, device);
    let memory = registry.buffer(buffer).unwrap().binding.memory;
    assert!(!memory.is_null());
    assert!(registry.memory(memory).is_ok());

    // Two shaders, one stage declaration each
    let bulk = ShaderBulk {
        shader_infos: vec![
            ShaderInfo::new(&VERTEX_SPIRV),
            ShaderInfo::new(&FRAGMENT_SPIRV),
        ],
        declares: vec![
            StageDecl {
                start: 0,
                end: 1,
                device,
                stage: vk::ShaderStageFlags::VERTEX,
                entry: "main".into(),
            },
            StageDecl {
                start: 1,
                end: 2,
                device,
                stage: vk::ShaderStageFlags::FRAGMENT,
                entry: "main".into(),
            },
        ],
    };
    let shaders = registry.add_shaders(&bulk).unwrap();
    assert_eq!(shaders.len(), 2);
    assert_eq!(
        registry.shader(shaders[1]).unwrap().stage,
        vk::ShaderStageFlags::FRAGMENT
    );

    // One empty frame
    registry.init_frames(device, queues.queues[0]).unwrap();
    dispatch_empty_frame(&mut registry).unwrap();
    let gathered = registry.async_gather(TIMEOUT);
    assert_eq!(Status::of(&gathered), Status::Good);
    assert_eq!(registry.frame_state(), FrameState::Idle);

    registry.close().unwrap();
    assert_eq!(registry.backend().live_total(), 0);
}

#[test]
fn frame_executes_recorded_work() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    let src = host_buffer(&mut registry, device);
    let dst = host_buffer(&mut registry, device);
    let shader = compute_shader(&mut registry, device);
    let pipeline = registry
        .create_pipeline(&PipelineDesc {
            device,
            kind: PipelineKind::Compute,
            shaders: vec![shader],
        })
        .unwrap();

    registry
        .enqueue(Command::FillBuffer {
            buffer: src,
            value: 0xdead_beef,
        })
        .unwrap();
    registry
        .enqueue(Command::Dispatch {
            pipeline,
            groups: [4, 1, 1],
        })
        .unwrap();
    registry.pre_update().unwrap();
    registry
        .do_update(|ctx| {
            ctx.record(Command::CopyBuffer {
                src,
                dst,
                size: vk::WHOLE_SIZE,
            })
        })
        .unwrap();
    registry.post_update().unwrap();
    registry.async_dispatch().unwrap();

    // Pinned until gathered
    assert!(matches!(
        registry.destroy_buffer(dst),
        Err(GpuError::StillReferenced { .. })
    ));

    let report = registry.async_gather(TIMEOUT).unwrap();
    assert_eq!(report.commands, 3);
    assert_eq!(registry.backend().dispatches(), 1);
    let bytes = registry.read_buffer(dst, 0, 4).unwrap();
    assert_eq!(bytes, 0xdead_beef_u32.to_le_bytes());

    registry.destroy_buffer(dst).unwrap();
}

#[test]
fn timed_out_gather_can_be_retried() {
    let mut registry = Registry::new(HeadlessBackend::default());
    init(&mut registry);
    let serial = dispatch_empty_frame(&mut registry).unwrap();

    registry.backend_mut().stall_waits(1);
    assert_eq!(
        registry.async_gather(TIMEOUT),
        Err(GpuError::GatherTimeout { slot: 0 })
    );
    assert_eq!(registry.frames_in_flight(), 1);

    let report = registry.async_gather(TIMEOUT).unwrap();
    assert_eq!(report.serial, serial);
    assert_eq!(registry.frames_in_flight(), 0);
}

#[test]
fn dispatching_a_busy_slot_is_refused() {
    let mut registry = Registry::new(HeadlessBackend::default());
    init(&mut registry);
    dispatch_empty_frame(&mut registry).unwrap();
    assert_eq!(
        registry.async_dispatch(),
        Err(GpuError::DispatchInFlight { slot: 0 })
    );
}

#[test]
fn gpu_fault_requires_close_and_reinit() {
    let mut registry = Registry::new(HeadlessBackend::default());
    init(&mut registry);

    registry.backend_mut().lose_device();
    assert_eq!(dispatch_empty_frame(&mut registry), Err(GpuError::GpuFault));
    assert_eq!(registry.frame_state(), FrameState::Faulted);
    assert_eq!(registry.pre_update(), Err(GpuError::GpuFault));
    assert_eq!(
        registry.enqueue(Command::Use(ResourceRef::Buffer(BufferHandle::NULL))),
        Err(GpuError::GpuFault)
    );

    registry.close().unwrap();
    assert_eq!(registry.backend().live_total(), 0);

    init(&mut registry);
    assert_eq!(registry.frame_state(), FrameState::Idle);
    dispatch_empty_frame(&mut registry).unwrap();
    registry.async_gather(TIMEOUT).unwrap();
}

#[test]
fn device_loss_outside_a_frame_faults_the_cycle() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    assert_eq!(registry.frame_state(), FrameState::Idle);

    registry.backend_mut().lose_device();
    assert_eq!(registry.wait_idle(device), Err(GpuError::GpuFault));
    assert_eq!(registry.frame_state(), FrameState::Faulted);
    assert_eq!(registry.pre_update(), Err(GpuError::GpuFault));

    registry.close().unwrap();
    assert_eq!(registry.backend().live_total(), 0);

    init(&mut registry);
    assert_eq!(registry.frame_state(), FrameState::Idle);
    dispatch_empty_frame(&mut registry).unwrap();
    registry.async_gather(TIMEOUT).unwrap();
}

#[test]
fn second_init_is_refused() {
    let mut registry = Registry::new(HeadlessBackend::default());
    init(&mut registry);
    assert_eq!(registry.default_init(), Err(GpuError::AlreadyInitialized));
}

#[test]
fn swapchain_needs_a_provider() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    assert_eq!(
        registry.create_swapchain(&SwapchainDesc::default(), 0, device),
        Err(GpuError::NoSurfaceProvider)
    );
}

#[test]
fn swapchain_recreation_survives_frames() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    registry.provide_surface_fun(|instance: &HeadlessInstance, window_index| {
        Ok(instance.create_surface(window_index))
    });
    let swapchain = registry
        .create_swapchain(&SwapchainDesc::default(), 0, device)
        .unwrap();

    registry
        .enqueue(Command::Use(ResourceRef::Swapchain(swapchain)))
        .unwrap();
    dispatch_empty_frame(&mut registry).unwrap();

    // Out of date swapchains are refused until recreated
    registry.invalidate_swapchain(swapchain).unwrap();
    registry
        .enqueue(Command::Use(ResourceRef::Swapchain(swapchain)))
        .unwrap();
    assert!(matches!(
        registry.pre_update(),
        Err(GpuError::ResourceNotReady(_))
    ));
    registry.clear_pending();

    let extent = vk::Extent2D {
        width: 640,
        height: 480,
    };
    registry.recreate_swapchain(swapchain, extent).unwrap();
    // The old native waits for the in-flight frame
    assert_eq!(registry.backend().live(ObjectKind::Swapchain), 2);
    registry.async_gather(TIMEOUT).unwrap();
    assert_eq!(registry.backend().live(ObjectKind::Swapchain), 1);

    let record = registry.swapchain(swapchain).unwrap();
    assert_eq!(record.info.extent, extent);
    assert_eq!(record.generation, 1);

    registry.close().unwrap();
    assert_eq!(registry.backend().live_total(), 0);
    assert_eq!(registry.backend().live(ObjectKind::Surface), 0);
}

#[test]
fn destroyed_swapchain_keeps_its_surface_for_in_flight_frames() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    registry.provide_surface_fun(|instance: &HeadlessInstance, window_index| {
        Ok(instance.create_surface(window_index))
    });
    let swapchain = registry
        .create_swapchain(&SwapchainDesc::default(), 0, device)
        .unwrap();

    dispatch_empty_frame(&mut registry).unwrap();
    let extent = vk::Extent2D {
        width: 800,
        height: 600,
    };
    registry.recreate_swapchain(swapchain, extent).unwrap();
    registry.destroy_swapchain(swapchain).unwrap();

    // The replaced native still needs the surface it was built on
    assert_eq!(registry.backend().live(ObjectKind::Swapchain), 1);
    assert_eq!(registry.backend().live(ObjectKind::Surface), 1);
    assert_eq!(registry.retired_count(), 2);

    registry.async_gather(TIMEOUT).unwrap();
    assert_eq!(registry.backend().live(ObjectKind::Swapchain), 0);
    assert_eq!(registry.backend().live(ObjectKind::Surface), 0);
    assert_eq!(registry.retired_count(), 0);

    registry.close().unwrap();
    assert_eq!(registry.backend().live_total(), 0);
}

#[test]
fn idle_swapchain_takes_its_surface_along() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    registry.provide_surface_fun(|instance: &HeadlessInstance, window_index| {
        Ok(instance.create_surface(window_index))
    });
    let swapchain = registry
        .create_swapchain(&SwapchainDesc::default(), 0, device)
        .unwrap();

    registry.destroy_swapchain(swapchain).unwrap();
    assert_eq!(registry.backend().live(ObjectKind::Swapchain), 0);
    assert_eq!(registry.backend().live(ObjectKind::Surface), 0);
    assert_eq!(registry.retired_count(), 0);
}

#[test]
fn shared_readers_wait_for_quiescence() {
    let mut registry = Registry::new(HeadlessBackend::default());
    init(&mut registry);
    let shared = SharedRegistry::new(registry);

    shared
        .update(|registry| dispatch_empty_frame(registry))
        .unwrap();
    assert_eq!(
        shared.inspect(|registry| registry.frames_in_flight()),
        Err(GpuError::NotQuiescent)
    );

    shared
        .update(|registry| registry.async_gather(TIMEOUT))
        .unwrap();
    assert_eq!(shared.inspect(|registry| registry.frames_in_flight()), Ok(0));
}

#[test]
fn close_releases_every_native_object() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    host_buffer(&mut registry, device);
    let shader = compute_shader(&mut registry, device);
    registry
        .create_pipeline(&PipelineDesc {
            device,
            kind: PipelineKind::Compute,
            shaders: vec![shader],
        })
        .unwrap();
    dispatch_empty_frame(&mut registry).unwrap();
    assert!(registry.backend().live_total() > 0);

    // Waits for the in-flight frame first
    registry.close().unwrap();
    assert!(!registry.is_initialized());
    assert_eq!(registry.backend().live_total(), 0);

    // Idempotent
    registry.close().unwrap();
}

#[test]
fn unsatisfiable_memory_changes_nothing() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    let live = registry.backend().live_total();

    let info = BufferInfo::new(
        device,
        BufferDesc::new(256, vk::BufferUsageFlags::TRANSFER_DST),
        vk::MemoryPropertyFlags::HOST_CACHED,
    );
    assert!(matches!(
        registry.create_buffer(&info),
        Err(GpuError::NoCompatibleMemoryType { .. })
    ));
    assert_eq!(registry.backend().live_total(), live);

    // Nothing else references the device
    registry.release_frames().unwrap();
    registry.destroy_device(device).unwrap();
}

#[test]
fn queue_family_limits_are_enforced() {
    let mut registry = Registry::new(HeadlessBackend::default());
    registry.default_init().unwrap();
    let physical = registry.preferred_physical_device().unwrap();

    let too_many = LogicalDeviceInfo {
        queues: vec![QueueDecl::new(1, vec![1.0, 1.0])],
        ..LogicalDeviceInfo::default()
    };
    assert_eq!(
        registry.init_queues(&too_many, physical),
        Err(GpuError::QueueFamilyExhausted {
            family: 1,
            requested: 2,
            available: 1
        })
    );
    assert_eq!(registry.backend().live(ObjectKind::Device), 0);
}

#[test]
fn replacing_an_unknown_shader_fails() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    let shader = compute_shader(&mut registry, device);
    registry.destroy_shader(shader).unwrap();

    assert_eq!(
        registry.add_shader(
            ShaderInfo::replacing(&COMPUTE_SPIRV, shader),
            device,
            vk::ShaderStageFlags::COMPUTE
        ),
        Err(GpuError::UnknownShaderHandle(shader.raw()))
    );
}

#[test]
fn replaced_shader_rebuilds_on_next_frame() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    let shader = compute_shader(&mut registry, device);
    let pipeline = registry
        .create_pipeline(&PipelineDesc {
            device,
            kind: PipelineKind::Compute,
            shaders: vec![shader],
        })
        .unwrap();
    assert_eq!(registry.backend().pipelines_built(), 1);

    let replacement = registry
        .add_shader(
            ShaderInfo::replacing(&COMPUTE_SPIRV, shader),
            device,
            vk::ShaderStageFlags::COMPUTE,
        )
        .unwrap();
    let record = registry.pipeline(pipeline).unwrap();
    assert!(record.stale);
    assert_eq!(record.shaders, vec![replacement]);
    // Nothing is rebuilt until the pipeline is used
    assert_eq!(registry.backend().pipelines_built(), 1);

    registry
        .enqueue(Command::Dispatch {
            pipeline,
            groups: [1, 1, 1],
        })
        .unwrap();
    dispatch_empty_frame(&mut registry).unwrap();
    assert_eq!(registry.backend().pipelines_built(), 2);
    assert!(!registry.pipeline(pipeline).unwrap().stale);
    registry.async_gather(TIMEOUT).unwrap();
}

#[test]
fn failed_rebuild_blocks_the_frame() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    let shader = compute_shader(&mut registry, device);
    let pipeline = registry
        .create_pipeline(&PipelineDesc {
            device,
            kind: PipelineKind::Compute,
            shaders: vec![shader],
        })
        .unwrap();
    registry
        .add_shader(
            ShaderInfo::replacing(&COMPUTE_SPIRV, shader),
            device,
            vk::ShaderStageFlags::COMPUTE,
        )
        .unwrap();

    registry
        .backend_mut()
        .fail_next(FailPoint::CreatePipeline, vk::Result::ERROR_INITIALIZATION_FAILED);
    registry
        .enqueue(Command::Dispatch {
            pipeline,
            groups: [1, 1, 1],
        })
        .unwrap();
    assert!(matches!(
        registry.pre_update(),
        Err(GpuError::ResourceNotReady(_))
    ));
    assert!(registry.pipeline(pipeline).unwrap().stale);
    assert_eq!(registry.frame_state(), FrameState::Idle);
    assert_eq!(registry.pending_commands().len(), 1);
}

#[test]
fn pipeline_rebuilt_after_recording_outlives_the_frame() {
    let mut registry = Registry::new(HeadlessBackend::default());
    let (device, _) = init(&mut registry);
    let shader = compute_shader(&mut registry, device);
    let pipeline = registry
        .create_pipeline(&PipelineDesc {
            device,
            kind: PipelineKind::Compute,
            shaders: vec![shader],
        })
        .unwrap();

    registry
        .enqueue(Command::Dispatch {
            pipeline,
            groups: [1, 1, 1],
        })
        .unwrap();
    registry.pre_update().unwrap();
    registry.do_update(|_| Ok(())).unwrap();
    registry.post_update().unwrap();

    // The recorded frame still refers to the first native pipeline
    registry
        .add_shader(
            ShaderInfo::replacing(&COMPUTE_SPIRV, shader),
            device,
            vk::ShaderStageFlags::COMPUTE,
        )
        .unwrap();
    registry.use_pipeline(pipeline).unwrap();
    assert_eq!(registry.backend().pipelines_built(), 2);
    assert_eq!(registry.backend().live(ObjectKind::Pipeline), 2);
    assert_eq!(registry.retired_count(), 1);

    registry.async_dispatch().unwrap();
    assert_eq!(registry.backend().live(ObjectKind::Pipeline), 2);

    registry.async_gather(TIMEOUT).unwrap();
    assert_eq!(registry.backend().live(ObjectKind::Pipeline), 1);
    assert_eq!(registry.retired_count(), 0);
}

#[test]
fn status_codes_have_messages() {
    let err = GpuError::GatherTimeout { slot: 1 };
    assert_eq!(err.status().code(), 18);
    assert_eq!(message_for_code(err.status().code()), Status::GatherTimeout.message());
    assert_eq!(message_for_code(999), Status::Bad.message());
}
