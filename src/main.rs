// =============================================================================
// VK-REGISTRY DEMO - drives the registry from a winit window
// =============================================================================
//
// Everything the demo touches goes through handles:
//
// FRAME FLOW:
// 1. Apply shader hot-reloads (replacement shaders mark pipelines stale)
// 2. Recreate the swapchain if the window changed
// 3. Queue this frame's commands (fill, copy, compute dispatch)
// 4. pre_update -> do_update -> post_update -> async_dispatch
// 5. Gather the oldest frame once every slot is in flight
//
// =============================================================================

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::prelude::VkResult;
use ash::vk;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Instant;
use vk_registry::backend::vulkan::VulkanInstance;
use vk_registry::backend::{BufferDesc, PipelineKind, SwapchainDesc};
use vk_registry::registry::{BufferInfo, LogicalDeviceInfo, PipelineDesc, QueueDecl, ShaderInfo};
use vk_registry::{
    BufferHandle, Command, Config, DeviceHandle, GpuError, PipelineHandle, Registry,
    ResourceRef, ShaderHandle, SwapchainHandle, VulkanBackend,
};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

const COMPUTE_SHADER: &str = "fill.comp.spv";
const READBACK_SIZE: vk::DeviceSize = 256;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting {}", config.app.name);
    log::info!(
        "Window: {}x{}, {} frame(s) in flight",
        config.window.width,
        config.window.height,
        config.frames.frames_in_flight
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output
fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::from_default_env();
    builder.filter_level(config.log_level());
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== {} Log ===", config.app.name);
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// SURFACE PROVIDER
// =============================================================================

/// Native window identity, reduced to plain integers so the provider is Send
#[derive(Debug, Clone, Copy)]
enum PlatformWindow {
    Win32 { hinstance: isize, hwnd: isize },
    Xlib { display: usize, window: u64 },
    Xcb { connection: usize, window: u32 },
    Wayland { display: usize, surface: usize },
}

impl PlatformWindow {
    fn from_window(window: &Window) -> Result<Self> {
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();

        let platform = match (display_handle, window_handle) {
            (_, RawWindowHandle::Win32(handle)) => PlatformWindow::Win32 {
                hinstance: handle.hinstance.map_or(0, |h| h.get()),
                hwnd: handle.hwnd.get(),
            },
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                PlatformWindow::Xlib {
                    display: display.display.map_or(0, |d| d.as_ptr() as usize),
                    window: handle.window as u64,
                }
            }
            (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => PlatformWindow::Xcb {
                connection: display.connection.map_or(0, |c| c.as_ptr() as usize),
                window: handle.window.get(),
            },
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                PlatformWindow::Wayland {
                    display: display.display.as_ptr() as usize,
                    surface: handle.surface.as_ptr() as usize,
                }
            }
            _ => anyhow::bail!("Unsupported window handle type"),
        };
        Ok(platform)
    }

    fn create_surface(&self, instance: &VulkanInstance) -> VkResult<vk::SurfaceKHR> {
        let (entry, native) = (&instance.entry, &instance.instance);
        // Safety: the handles come from a live winit window that outlives the registry
        unsafe {
            match *self {
                PlatformWindow::Win32 { hinstance, hwnd } => {
                    let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                        .hinstance(hinstance as *const std::ffi::c_void)
                        .hwnd(hwnd as *const std::ffi::c_void);
                    khr::Win32Surface::new(entry, native).create_win32_surface(&create_info, None)
                }
                PlatformWindow::Xlib { display, window } => {
                    let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                        .dpy(display as *mut vk::Display)
                        .window(window as vk::Window);
                    khr::XlibSurface::new(entry, native).create_xlib_surface(&create_info, None)
                }
                PlatformWindow::Xcb { connection, window } => {
                    let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                        .connection(connection as *mut vk::xcb_connection_t)
                        .window(window);
                    khr::XcbSurface::new(entry, native).create_xcb_surface(&create_info, None)
                }
                PlatformWindow::Wayland { display, surface } => {
                    let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                        .display(display as *mut vk::wl_display)
                        .surface(surface as *mut vk::wl_surface);
                    khr::WaylandSurface::new(entry, native)
                        .create_wayland_surface(&create_info, None)
                }
            }
        }
    }
}

// =============================================================================
// SHADER HOT-RELOAD
// =============================================================================

fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open shader {}", path.display()))?;
    ash::util::read_spv(&mut file)
        .with_context(|| format!("Failed to read SPIR-V from {}", path.display()))
}

/// Watches the shader directory; changed `.spv` files come out of `changed()`
struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<notify::Event>>,
}

impl ShaderWatcher {
    fn new(directory: &Path) -> Result<Self> {
        let (tx, events) = channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let _ = tx.send(event);
        })
        .context("Failed to create shader watcher")?;
        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", directory.display()))?;
        log::info!("Watching {} for shader changes", directory.display());
        Ok(Self {
            _watcher: watcher,
            events,
        })
    }

    fn changed(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for event in self.events.try_iter() {
            match event {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    for path in event.paths {
                        let is_spirv = path.extension().is_some_and(|ext| ext == "spv");
                        if is_spirv && !paths.contains(&path) {
                            paths.push(path);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("Shader watcher error: {}", e),
            }
        }
        paths
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Handles the demo keeps between frames
struct Scene {
    device: DeviceHandle,
    swapchain: SwapchainHandle,
    source: BufferHandle,
    readback: BufferHandle,
    pipeline: PipelineHandle,
    /// Current shader handle per file name
    shaders: HashMap<PathBuf, ShaderHandle>,
}

pub struct App {
    config: Config,
    window: Option<Arc<Window>>,
    registry: Option<Registry<VulkanBackend>>,
    scene: Option<Scene>,
    watcher: Option<ShaderWatcher>,

    /// Set when the window is resized - triggers swapchain recreation
    needs_resize: bool,
    /// Set when the window is minimized (size = 0) - skip frames
    is_minimized: bool,

    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            registry: None,
            scene: None,
            watcher: None,
            needs_resize: false,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Build the registry and every object the demo uses.
    ///
    /// 1. Instance (default extensions/layers) and a physical device
    /// 2. Device with one graphics+compute queue
    /// 3. Swapchain through the window's surface
    /// 4. Buffers, compute shader and pipeline
    /// 5. Frame slots
    fn init_registry(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing registry...");

        let backend = VulkanBackend::new()?;
        let mut registry = Registry::with_config(backend, &self.config);
        registry.default_init()?;

        let physical = registry
            .preferred_physical_device()
            .context("No Vulkan physical device found")?;
        let info = registry.physical_device(physical)?;
        log::info!("Using GPU: {}", info.name());
        let family = info
            .queue_families
            .iter()
            .position(|family| {
                family
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .context("No graphics + compute queue family")? as u32;

        let device_info = LogicalDeviceInfo {
            queues: vec![QueueDecl::new(family, vec![1.0])],
            extensions: vec!["VK_KHR_swapchain".to_string()],
            ..LogicalDeviceInfo::default()
        };
        let queues = registry.init_queues(&device_info, physical)?;
        let device = queues.device;

        let platform = PlatformWindow::from_window(window)?;
        registry.provide_surface_fun(move |instance: &VulkanInstance, _window_index| {
            platform.create_surface(instance)
        });
        let size = window.inner_size();
        let swapchain_desc = SwapchainDesc {
            extent: vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            present_mode: self.config.present_mode(),
            ..SwapchainDesc::default()
        };
        let swapchain = registry.create_swapchain(&swapchain_desc, 0, device)?;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let transfer = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        let source = registry.create_buffer(&BufferInfo::new(
            device,
            BufferDesc::new(READBACK_SIZE, transfer | vk::BufferUsageFlags::STORAGE_BUFFER),
            host,
        ))?;
        let readback = registry.create_buffer(&BufferInfo::new(
            device,
            BufferDesc::new(READBACK_SIZE, transfer),
            host,
        ))?;

        // notify reports absolute paths
        let directory = PathBuf::from(&self.config.shaders.directory);
        let directory = std::fs::canonicalize(&directory).unwrap_or(directory);
        let compute_path = directory.join(COMPUTE_SHADER);
        let code = read_spirv(&compute_path)?;
        let shader = registry.add_shader(
            ShaderInfo::new(&code),
            device,
            vk::ShaderStageFlags::COMPUTE,
        )?;
        let pipeline = registry.create_pipeline(&PipelineDesc {
            device,
            kind: PipelineKind::Compute,
            shaders: vec![shader],
        })?;

        registry.init_frames(device, queues.queues[0])?;

        if self.config.shaders.hot_reload {
            match ShaderWatcher::new(&directory) {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(e) => log::warn!("Shader hot-reload disabled: {:#}", e),
            }
        }

        let mut shaders = HashMap::new();
        shaders.insert(compute_path, shader);
        self.scene = Some(Scene {
            device,
            swapchain,
            source,
            readback,
            pipeline,
            shaders,
        });
        self.registry = Some(registry);

        log::info!("Registry initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // HOT-RELOAD & RESIZE
    // =========================================================================

    /// Register changed shaders as replacements of the ones they came from
    fn apply_shader_changes(&mut self) {
        let (Some(watcher), Some(registry), Some(scene)) =
            (&self.watcher, self.registry.as_mut(), self.scene.as_mut())
        else {
            return;
        };

        for path in watcher.changed() {
            let Some(&existing) = scene.shaders.get(&path) else {
                continue;
            };
            let code = match read_spirv(&path) {
                Ok(code) => code,
                Err(e) => {
                    log::warn!("Skipping reload: {:#}", e);
                    continue;
                }
            };
            match registry.add_shader(
                ShaderInfo::replacing(&code, existing),
                scene.device,
                vk::ShaderStageFlags::COMPUTE,
            ) {
                Ok(shader) => {
                    log::info!("Reloaded {}", path.display());
                    scene.shaders.insert(path, shader);
                    if let Err(e) = registry.destroy_shader(existing) {
                        log::debug!("Keeping replaced shader: {}", e);
                    }
                }
                Err(e) => log::error!("Reload of {} failed: {}", path.display(), e),
            }
        }
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        let (Some(window), Some(registry), Some(scene)) =
            (&self.window, self.registry.as_mut(), self.scene.as_ref())
        else {
            return Ok(());
        };

        let size = window.inner_size();
        registry.invalidate_swapchain(scene.swapchain)?;
        registry.recreate_swapchain(
            scene.swapchain,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        )?;
        self.needs_resize = false;
        Ok(())
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    /// Run one frame of the cycle. Returns false when nothing was dispatched.
    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        self.apply_shader_changes();
        if self.needs_resize {
            self.recreate_swapchain()?;
        }

        let timeout = self.config.gather_timeout();
        let frames_in_flight = self.config.frames.frames_in_flight;
        let (Some(registry), Some(scene)) = (self.registry.as_mut(), self.scene.as_ref()) else {
            return Ok(false);
        };

        // Make room: gather the oldest frame once every slot is busy
        if registry.frames_in_flight() >= frames_in_flight {
            match registry.async_gather(timeout) {
                Ok(report) => {
                    let word = registry.read_buffer(scene.readback, 0, 4)?;
                    log::trace!("Gathered {:?}, readback {:02x?}", report, word);
                }
                Err(GpuError::GatherTimeout { slot }) => {
                    log::warn!("Frame slot {} still busy, skipping frame", slot);
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }

        registry.enqueue(Command::Use(ResourceRef::Swapchain(scene.swapchain)))?;
        registry.enqueue(Command::FillBuffer {
            buffer: scene.source,
            value: self.frame_count,
        })?;
        registry.enqueue(Command::Dispatch {
            pipeline: scene.pipeline,
            groups: [(READBACK_SIZE / 4 / 64) as u32, 1, 1],
        })?;

        if let Err(e) = registry.pre_update() {
            registry.clear_pending();
            return Err(e.into());
        }
        let (source, readback) = (scene.source, scene.readback);
        let recorded = registry.do_update(|ctx| {
            ctx.record(Command::CopyBuffer {
                src: source,
                dst: readback,
                size: vk::WHOLE_SIZE,
            })
        });
        if let Err(e) = recorded {
            registry.abandon_frame()?;
            return Err(e.into());
        }
        registry.post_update()?;
        registry.async_dispatch()?;
        Ok(true)
    }

    /// Log FPS once per second
    fn update_fps(&mut self) {
        self.frame_count = self.frame_count.wrapping_add(1);

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update);
        if elapsed.as_secs_f32() >= 1.0 {
            let fps = self.frame_count as f32 / elapsed.as_secs_f32();
            log::info!("FPS: {:.0}", fps);

            if let Some(ref window) = self.window {
                window.set_title(&format!("{} | FPS: {:.0}", self.config.window.title, fps));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_registry(&window) {
            log::error!("Failed to initialize registry: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Frame error: {:?}", e);
                    // A faulted registry only recovers through close()
                    let fatal = e
                        .downcast_ref::<GpuError>()
                        .is_some_and(GpuError::is_fatal);
                    if fatal {
                        event_loop.exit();
                    }
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up...");

        // The registry waits for in-flight frames and destroys everything
        // in reverse dependency order; it must go before the window.
        if let Some(mut registry) = self.registry.take() {
            if let Err(e) = registry.close() {
                log::error!("Failed to close registry: {}", e);
            }
        }
        self.scene = None;
        self.window = None;

        log::info!("Cleanup complete");
    }
}
