use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use pisvox::camera::{FlyCamera, MoveInput};
use pisvox::render::{RenderContext, RenderParams};
use pisvox::vox;
use pisvox::vulkan_setup::vulkan_setup;
use vulkano::device::{Device, Queue};
use vulkano::instance::Instance;
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::{DeviceEvent, DeviceId, ElementState, KeyEvent, MouseButton, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{CursorGrabMode, Window, WindowId},
};

const FOV_STEP_DEGREES: f32 = 0.5;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "PISV voxel scene viewer")]
struct Args {
    /// Scene file to load
    scene: PathBuf,

    /// Precompiled ray-march compute shader
    #[arg(long, default_value = "shaders/raymarch.spv")]
    shader: PathBuf,

    /// Initial window width in pixels
    #[arg(long, short = 'W', default_value_t = 1280)]
    width: u32,

    /// Initial window height in pixels
    #[arg(long, short = 'H', default_value_t = 720)]
    height: u32,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let (volume, palette) = vox::decode_file(&args.scene)
        .with_context(|| format!("loading scene {}", args.scene.display()))?;
    let [x, y, z] = volume.extent();
    info!("loaded {}: {x}x{y}x{z} voxels", args.scene.display());

    let event_loop = EventLoop::new()?;
    let (instance, device, queue) = vulkan_setup(&event_loop)?;

    let mut app = App {
        instance,
        device,
        queue,
        volume,
        palette,
        rcx: None,
        camera: FlyCamera::default(),
        held: HeldKeys::default(),
        mouse_delta: (0.0, 0.0),
        mouse_grabbed: false,
        start_time: Instant::now(),
        fatal: None,
        args,
    };
    event_loop.run_app(&mut app)?;

    match app.fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct HeldKeys {
    movement: MoveInput,
    fov_narrow: bool,
    fov_widen: bool,
    shift: bool,
}

struct App {
    instance: Arc<Instance>,
    device: Arc<Device>,
    queue: Arc<Queue>,
    volume: vox::VoxelVolume,
    palette: vox::MaterialPalette,
    rcx: Option<RenderContext>,
    camera: FlyCamera,
    held: HeldKeys,
    mouse_delta: (f32, f32),
    mouse_grabbed: bool,
    start_time: Instant,
    fatal: Option<anyhow::Error>,
    args: Args,
}

impl App {
    fn grab_mouse(&mut self, window: &Window) {
        let result = window
            .set_cursor_grab(CursorGrabMode::Locked)
            .or_else(|_| window.set_cursor_grab(CursorGrabMode::Confined));
        if result.is_ok() {
            window.set_cursor_visible(false);
            self.mouse_grabbed = true;
        }
    }

    fn release_mouse(&mut self, window: &Window) {
        let _ = window.set_cursor_grab(CursorGrabMode::None);
        window.set_cursor_visible(true);
        self.mouse_grabbed = false;
    }

    fn handle_key(&mut self, event: &KeyEvent) {
        let held = event.state == ElementState::Pressed;
        let PhysicalKey::Code(code) = event.physical_key else {
            return;
        };
        match code {
            KeyCode::KeyW => self.held.movement.forward = held,
            KeyCode::KeyS => self.held.movement.back = held,
            KeyCode::KeyA => self.held.movement.left = held,
            KeyCode::KeyD => self.held.movement.right = held,
            KeyCode::ShiftLeft => {
                self.held.movement.up = held;
                self.held.shift = held;
            }
            KeyCode::ControlLeft => self.held.movement.down = held,
            KeyCode::Minus => self.held.fov_narrow = held,
            KeyCode::Equal => self.held.fov_widen = held,
            _ => {}
        }
    }

    fn update_and_render(&mut self, event_loop: &ActiveEventLoop) {
        let (dx, dy) = std::mem::take(&mut self.mouse_delta);
        if self.mouse_grabbed {
            self.camera.look(dx, dy);
            self.camera.step(self.held.movement);
        }
        if self.held.fov_widen && self.held.shift {
            self.camera.reset_fov();
        } else {
            if self.held.fov_narrow {
                self.camera.adjust_fov(-FOV_STEP_DEGREES);
            }
            if self.held.fov_widen {
                self.camera.adjust_fov(FOV_STEP_DEGREES);
            }
        }

        let (forward, right, up) = self.camera.basis();
        let params = RenderParams::new(
            self.camera.position,
            forward,
            right,
            up,
            self.camera.fov_degrees(),
            self.start_time.elapsed().as_secs_f32(),
        );

        let Some(rcx) = self.rcx.as_mut() else {
            return;
        };
        if let Err(e) = rcx.draw(params) {
            error!("frame {} failed: {e}", rcx.frames_rendered());
            self.fatal = Some(anyhow::Error::new(e).context("rendering failed"));
            event_loop.exit();
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let window = match event_loop.create_window(
            Window::default_attributes()
                .with_title("pisvox")
                .with_inner_size(LogicalSize::new(self.args.width, self.args.height)),
        ) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                self.fatal = Some(anyhow::Error::new(e).context("creating the window"));
                event_loop.exit();
                return;
            }
        };
        self.grab_mouse(&window);

        match RenderContext::new(
            self.device.clone(),
            self.queue.clone(),
            self.instance.clone(),
            window,
            &self.volume,
            &self.palette,
            &self.args.shader,
        ) {
            Ok(rcx) => self.rcx = Some(rcx),
            Err(e) => {
                self.fatal = Some(anyhow::Error::new(e).context("initializing the renderer"));
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(_) => {
                if let Some(rcx) = self.rcx.as_mut() {
                    rcx.recreate_swapchain();
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                    && event.state == ElementState::Pressed
                {
                    if self.mouse_grabbed {
                        if let Some(rcx) = self.rcx.as_ref() {
                            let window = rcx.window().clone();
                            self.release_mouse(&window);
                        }
                    } else {
                        event_loop.exit();
                    }
                    return;
                }
                self.handle_key(&event);
            }
            WindowEvent::MouseInput {
                button: MouseButton::Left,
                state: ElementState::Pressed,
                ..
            } => {
                if !self.mouse_grabbed {
                    if let Some(rcx) = self.rcx.as_ref() {
                        let window = rcx.window().clone();
                        self.grab_mouse(&window);
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                self.update_and_render(event_loop);
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            self.mouse_delta.0 += dx as f32;
            self.mouse_delta.1 += dy as f32;
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(rcx) = self.rcx.as_ref() {
            rcx.window().request_redraw();
        }
    }
}
