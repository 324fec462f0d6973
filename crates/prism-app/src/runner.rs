//! Application runner and event loop.

use std::time::Instant;

use prism_core::{Config, RuntimeOptions};
use prism_gpu::{ApplicationInfo, GpuContextBuilder};
use prism_platform::{WindowHost, WindowSettings, WinitHost};
use prism_render::{FrameStatus, Renderer};
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

/// Frame timing collected over a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub frame_count: u64,
    pub min_fps: f64,
    pub max_fps: f64,
    fps_sum: f64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            frame_count: 0,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        }
    }
}

impl FrameStats {
    /// Record a presented frame that took `dt` seconds.
    pub fn record(&mut self, dt: f64) {
        self.frame_count += 1;
        if dt > 0.0 {
            let fps = 1.0 / dt;
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }
    }

    pub fn average_fps(&self) -> Option<f64> {
        (self.frame_count > 0).then(|| self.fps_sum / self.frame_count as f64)
    }

    fn log(&self) {
        if let Some(avg_fps) = self.average_fps() {
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.frame_count);
        }
    }
}

/// How a close request is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseAction {
    /// The next redraw sees the close flag and idles the device.
    Redraw,
    /// Shut down immediately; a minimised window may never be redrawn.
    ExitNow,
}

impl CloseAction {
    fn for_window(minimized: bool) -> Self {
        if minimized {
            Self::ExitNow
        } else {
            Self::Redraw
        }
    }
}

/// Identity passed to the driver.
pub fn application_info(config: &Config) -> ApplicationInfo {
    ApplicationInfo {
        app_name: config.application.name.clone(),
        app_version: config.application.version,
        engine_name: config.application.engine.name.clone(),
        engine_version: config.application.engine.version,
    }
}

/// Open the window, build the renderer and run until the window closes.
///
/// Returns the first fatal error, if any.
pub fn run(config: Config, options: RuntimeOptions) -> anyhow::Result<()> {
    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner {
        config,
        options,
        state: None,
        fatal: None,
    };
    event_loop.run_app(&mut runner)?;

    match runner.fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct AppRunner {
    config: Config,
    options: RuntimeOptions,
    state: Option<AppState>,
    fatal: Option<anyhow::Error>,
}

struct AppState {
    // Declared first so the renderer is torn down before the window.
    renderer: Renderer,
    host: WinitHost,
    stats: FrameStats,
    last_frame_time: Instant,
    minimized: bool,
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => self.fail(event_loop, e.context("Failed to initialize application")),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                state.host.flags().request_close();
                let minimized = state.minimized || state.host.is_minimized();
                match CloseAction::for_window(minimized) {
                    CloseAction::Redraw => state.host.request_redraw(),
                    CloseAction::ExitNow => {
                        self.shutdown();
                        event_loop.exit();
                    }
                }
            }
            WindowEvent::Resized(size) => {
                state.host.flags().mark_resized();
                if size.width > 0 && size.height > 0 && state.minimized {
                    state.minimized = false;
                    event_loop.set_control_flow(ControlFlow::Poll);
                    state.host.request_redraw();
                }
            }
            WindowEvent::RedrawRequested => match state.renderer.draw_frame(&state.host) {
                Ok(FrameStatus::Presented) => {
                    let now = Instant::now();
                    let dt = now.duration_since(state.last_frame_time).as_secs_f64();
                    state.last_frame_time = now;
                    state.stats.record(dt);
                }
                Ok(FrameStatus::Skipped) => {}
                Ok(FrameStatus::Minimized) => {
                    if !state.minimized {
                        tracing::debug!("Window minimised, waiting for a resize");
                    }
                    state.minimized = true;
                    event_loop.set_control_flow(ControlFlow::Wait);
                }
                Ok(FrameStatus::ShutdownRequested) => {
                    self.shutdown();
                    event_loop.exit();
                }
                Err(e) => {
                    let e = anyhow::Error::new(e).context("Render error");
                    self.fail(event_loop, e);
                }
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            if !state.minimized {
                state.host.request_redraw();
            }
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

impl AppRunner {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState> {
        let settings = WindowSettings::from(&self.config.application.window);
        let host = WinitHost::create(event_loop, &settings)?;

        let (display, window) = host.raw_handles()?;
        let gpu = GpuContextBuilder::new()
            .app_info(application_info(&self.config))
            .options(self.options)
            .build_for_window(display, window)?;

        let renderer = Renderer::new(gpu, &self.config, &host)?;

        Ok(AppState {
            renderer,
            host,
            stats: FrameStats::default(),
            last_frame_time: Instant::now(),
            minimized: false,
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.shutdown();
        self.fatal.get_or_insert(e);
        event_loop.exit();
    }

    fn shutdown(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };

        state.stats.log();

        info!("Starting cleanup...");
        if let Err(e) = state.renderer.shutdown() {
            error!("Renderer shutdown failed: {e}");
        }
        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn stats_track_min_max_and_average() {
        let mut stats = FrameStats::default();
        stats.record(0.010);
        stats.record(0.020);
        stats.record(0.005);

        assert_eq!(stats.frame_count, 3);
        assert_relative_eq!(stats.min_fps, 50.0, epsilon = 1e-9);
        assert_relative_eq!(stats.max_fps, 200.0, epsilon = 1e-9);
        assert_relative_eq!(
            stats.average_fps().unwrap_or_default(),
            (100.0 + 50.0 + 200.0) / 3.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn no_frames_no_average() {
        assert_eq!(FrameStats::default().average_fps(), None);
    }

    #[test]
    fn zero_duration_frames_are_counted_without_fps() {
        let mut stats = FrameStats::default();
        stats.record(0.0);
        assert_eq!(stats.frame_count, 1);
        assert_relative_eq!(stats.max_fps, 0.0);
    }

    #[test]
    fn close_while_minimised_exits_without_a_redraw() {
        assert_eq!(CloseAction::for_window(true), CloseAction::ExitNow);
        assert_eq!(CloseAction::for_window(false), CloseAction::Redraw);
    }

    #[test]
    fn application_info_comes_from_config() {
        let config = Config::from_toml_str(
            r#"
            title = "Viewer"
            [application]
            name = "viewer"
            version = { major = 1, minor = 2, patch = 3 }
            [application.engine]
            name = "prism"
            version = { major = 0, minor = 4, patch = 0 }
            "#,
        )
        .expect("config parses");
        let info = application_info(&config);
        assert_eq!(info.app_name, "viewer");
        assert_eq!(info.app_version, prism_core::Version::new(1, 2, 3));
        assert_eq!(info.engine_name, "prism");
        assert_eq!(info.engine_version, prism_core::Version::new(0, 4, 0));
    }
}
