//! Windowed demo: a spinning checkerboard quad with an additive
//! multitexture overlay. Exercises sampler and texture setup, the pipeline
//! cache, per-frame geometry streams and swapchain rebuilds (resize the
//! window or toggle fullscreen with F).
//!
//! Shaders must be compiled first: see `shaders/compile.sh`.

use std::time::Instant;

use log::{debug, error, info, warn};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::dpi::LogicalSize;
use winit::event::{ElementState, Event, VirtualKeyCode, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::window::{Fullscreen, Window, WindowBuilder};

use strafe_render::{
    mip_regions, read_spirv_file, BeginOutcome, ConfigBuilder, DrawSubmission, GfxResult,
    MagFilter, MinFilter, PipelineState, PresentOutcome, Renderer, SamplerDesc, ShaderPairSources,
    ShaderSetSources, ShaderVariant, StateBits, CullFace, Texture,
};

const SHADER_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders");

const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];
const WHITE: [[u8; 4]; 4] = [[255; 4]; 4];

struct ShaderBytes {
    single_v: Vec<u8>,
    single_vc: Vec<u8>,
    single_f: Vec<u8>,
    multi_v: Vec<u8>,
    multi_vc: Vec<u8>,
    multi_mul_f: Vec<u8>,
    multi_add_f: Vec<u8>,
}

impl ShaderBytes {
    fn load() -> Result<Self, String> {
        let read = |name: &str| {
            read_spirv_file(format!("{SHADER_DIR}/{name}")).map_err(|e| {
                format!("{name}: {e} (compile the shaders with {SHADER_DIR}/compile.sh)")
            })
        };
        Ok(Self {
            single_v: read("single.vert.spv")?,
            single_vc: read("single_clip.vert.spv")?,
            single_f: read("single.frag.spv")?,
            multi_v: read("multi.vert.spv")?,
            multi_vc: read("multi_clip.vert.spv")?,
            multi_mul_f: read("multi_mul.frag.spv")?,
            multi_add_f: read("multi_add.frag.spv")?,
        })
    }

    fn sources(&self) -> ShaderSetSources<'_> {
        ShaderSetSources {
            single: ShaderPairSources {
                vertex: &self.single_v,
                vertex_clip: &self.single_vc,
                fragment: &self.single_f,
            },
            multi_mul: ShaderPairSources {
                vertex: &self.multi_v,
                vertex_clip: &self.multi_vc,
                fragment: &self.multi_mul_f,
            },
            multi_add: ShaderPairSources {
                vertex: &self.multi_v,
                vertex_clip: &self.multi_vc,
                fragment: &self.multi_add_f,
            },
        }
    }
}

/// Checkerboard with a full mip chain; each level shifts hue so filtering
/// across levels is visible.
fn checker_payload(size: u32) -> Vec<u8> {
    let regions = mip_regions(size, size, true, 4);
    let mut out = Vec::with_capacity(regions.iter().map(|r| r.len as usize).sum());
    for r in &regions {
        let tint = (r.level * 28).min(200) as u8;
        for y in 0..r.height {
            for x in 0..r.width {
                let on = ((x / 8) + (y / 8)) % 2 == 0;
                let base: u8 = if on { 230 } else { 40 };
                out.extend_from_slice(&[base, base.saturating_sub(tint), tint.max(60), 255]);
            }
        }
    }
    out
}

/// Single-level radial falloff used as the additive glow layer.
fn glow_payload(size: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((size * size * 4) as usize);
    let center = (size as f32 - 1.0) / 2.0;
    for y in 0..size {
        for x in 0..size {
            let dx = (x as f32 - center) / center;
            let dy = (y as f32 - center) / center;
            let d = (dx * dx + dy * dy).sqrt().min(1.0);
            let v = ((1.0 - d) * 255.0) as u8;
            out.extend_from_slice(&[v, v / 2, 255 - v, v]);
        }
    }
    out
}

fn quad_positions(half: f32, z: f32) -> [[f32; 4]; 4] {
    [
        [-half, -half, z, 1.0],
        [half, -half, z, 1.0],
        [half, half, z, 1.0],
        [-half, half, z, 1.0],
    ]
}

fn quad_tc(scale: f32) -> [[f32; 2]; 4] {
    [[0.0, 0.0], [scale, 0.0], [scale, scale], [0.0, scale]]
}

/// Column-major rotation around Z with horizontal aspect correction.
fn spin_transform(angle: f32, aspect: f32) -> [f32; 16] {
    let (s, c) = angle.sin_cos();
    [
        c / aspect, s, 0.0, 0.0,
        -s / aspect, c, 0.0, 0.0,
        0.0, 0.0, 1.0, 0.0,
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// Column-major uniform scale plus translation.
fn place_transform(scale: f32, tx: f32, ty: f32, aspect: f32) -> [f32; 16] {
    [
        scale / aspect, 0.0, 0.0, 0.0,
        0.0, scale, 0.0, 0.0,
        0.0, 0.0, 1.0, 0.0,
        tx, ty, 0.0, 1.0,
    ]
}

struct App {
    window: Window,
    renderer: Renderer,
    checker: Texture,
    glow: Texture,
    start: Instant,
    frames: u64,
}

impl App {
    fn frame(&mut self) -> GfxResult<()> {
        if self.renderer.rebuild_pending() {
            self.rebuild()?;
        }
        match self.renderer.begin_frame()? {
            BeginOutcome::RebuildNeeded => {
                self.rebuild()?;
                return Ok(());
            }
            BeginOutcome::Ready => {}
        }
        self.renderer.clear_color([0.05, 0.06, 0.08, 1.0])?;

        let size = self.window.inner_size();
        let aspect = size.width.max(1) as f32 / size.height.max(1) as f32;
        let t = self.start.elapsed().as_secs_f32();

        // Spinning checker, plain opaque single-texture path.
        let spin = DrawSubmission {
            positions: &quad_positions(0.62, 0.5),
            colors: &WHITE,
            tc0: &quad_tc(2.0),
            tc1: None,
            indices: &QUAD_INDICES,
            transform: spin_transform(t * 0.6, aspect),
        };
        let opaque = PipelineState::opaque(ShaderVariant::SingleTexture);
        self.renderer.draw(&opaque, &self.checker, None, &spin)?;

        // Additive checker*glow overlay in the corner, no depth write.
        let overlay = DrawSubmission {
            positions: &quad_positions(0.5, 0.4),
            colors: &WHITE,
            tc0: &quad_tc(1.0),
            tc1: Some(&quad_tc(1.0)),
            indices: &QUAD_INDICES,
            transform: place_transform(0.45, 0.6, -0.55, aspect),
        };
        let mut additive = PipelineState::opaque(ShaderVariant::MultiTextureAdd);
        additive.bits = StateBits::SRC_BLEND_ONE | StateBits::DST_BLEND_ONE;
        additive.cull = CullFace::None;
        self.renderer.draw(&additive, &self.checker, Some(&self.glow), &overlay)?;

        if self.renderer.end_frame()? == PresentOutcome::RebuildNeeded {
            self.rebuild()?;
        }

        self.frames += 1;
        if self.frames % 600 == 0 {
            let stats = self.renderer.pipeline_stats();
            debug!(
                "frame {}: {} pipelines ({:?} total build), {} samplers",
                self.frames,
                stats.created,
                stats.total_build_time,
                self.renderer.sampler_count()
            );
        }
        Ok(())
    }

    /// Rebuild the swapchain at the window's current size. If that fails
    /// while fullscreen, drop back to windowed mode and retry once.
    fn rebuild(&mut self) -> GfxResult<()> {
        let size = self.window.inner_size();
        match self.renderer.recreate_swapchain(size.width.max(1), size.height.max(1)) {
            Ok(()) => Ok(()),
            Err(e) if self.window.fullscreen().is_some() => {
                warn!("fullscreen rebuild failed ({e}), returning to windowed");
                self.window.set_fullscreen(None);
                let size = self.window.inner_size();
                self.renderer.recreate_swapchain(size.width.max(1), size.height.max(1))
            }
            Err(e) => Err(e),
        }
    }

    fn toggle_fullscreen(&self) {
        if self.window.fullscreen().is_some() {
            self.window.set_fullscreen(None);
        } else {
            self.window.set_fullscreen(Some(Fullscreen::Borderless(None)));
        }
    }

    /// Free the textures before the renderer goes down.
    fn shutdown(self) {
        let App { mut renderer, checker, glow, .. } = self;
        if let Err(e) = renderer.destroy_texture(checker) {
            warn!("texture teardown: {e}");
        }
        if let Err(e) = renderer.destroy_texture(glow) {
            warn!("texture teardown: {e}");
        }
    }
}

fn main() {
    env_logger::init();

    let shader_bytes = match ShaderBytes::load() {
        Ok(b) => b,
        Err(e) => {
            error!("shader load failed: {e}");
            std::process::exit(1);
        }
    };

    let cfg = ConfigBuilder::new()
        .app("strafe demo")
        .surface(1280, 720, true)
        .build()
        .expect("default config is valid");

    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("strafe demo")
        .with_inner_size(LogicalSize::new(
            cfg.surface.width as f64,
            cfg.surface.height as f64,
        ))
        .build(&event_loop)
        .expect("create window");

    let mut renderer = Renderer::new(
        window.raw_display_handle(),
        window.raw_window_handle(),
        cfg,
        &shader_bytes.sources(),
    )
    .expect("renderer init");

    let sampler_mipped = renderer
        .resolve_sampler(SamplerDesc {
            repeat: true,
            mag: MagFilter::Linear,
            min: MinFilter::LinearMipLinear,
        })
        .expect("sampler");
    let sampler_plain = renderer
        .resolve_sampler(SamplerDesc {
            repeat: false,
            mag: MagFilter::Linear,
            min: MinFilter::Linear,
        })
        .expect("sampler");

    let checker = renderer
        .create_texture(256, 256, true, sampler_mipped)
        .expect("checker texture");
    renderer
        .upload_texture(&checker, &checker_payload(256))
        .expect("checker upload");
    let glow = renderer
        .create_texture(128, 128, false, sampler_plain)
        .expect("glow texture");
    renderer
        .upload_texture(&glow, &glow_payload(128))
        .expect("glow upload");

    info!("demo ready, F toggles fullscreen, Escape quits");
    let mut app = Some(App {
        window,
        renderer,
        checker,
        glow,
        start: Instant::now(),
        frames: 0,
    });

    event_loop.run(move |event, _, control_flow| {
        *control_flow = ControlFlow::Poll;
        match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => *control_flow = ControlFlow::Exit,
                WindowEvent::KeyboardInput { input, .. } => {
                    if input.state == ElementState::Pressed {
                        match input.virtual_keycode {
                            Some(VirtualKeyCode::Escape) => *control_flow = ControlFlow::Exit,
                            Some(VirtualKeyCode::F) => {
                                if let Some(app) = app.as_ref() {
                                    app.toggle_fullscreen();
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            },
            Event::MainEventsCleared => {
                if let Some(app) = app.as_mut() {
                    if let Err(e) = app.frame() {
                        error!("frame failed: {e}");
                        *control_flow = ControlFlow::Exit;
                    }
                }
            }
            Event::LoopDestroyed => {
                // Tears the renderer down (with its device wait) before the
                // process exits.
                if let Some(app) = app.take() {
                    app.shutdown();
                }
            }
            _ => {}
        }
    });
}
