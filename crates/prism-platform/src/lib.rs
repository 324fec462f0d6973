//! Platform abstraction for the Prism renderer.
//!
//! The renderer talks to the window through [`WindowHost`]: raw handles for
//! surface creation, the current framebuffer size, and the close and resize
//! flags set by the event loop. [`WinitHost`] implements it on top of winit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use prism_core::config::WindowConfig;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::Window;

pub use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Event loop error: {0}")]
    EventLoop(String),
    #[error("Window handle unavailable: {0}")]
    Handle(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Window creation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSettings {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self::from(&WindowConfig::default())
    }
}

impl From<&WindowConfig> for WindowSettings {
    fn from(config: &WindowConfig) -> Self {
        Self {
            title: config.name.clone(),
            width: config.width,
            height: config.height,
            resizable: true,
        }
    }
}

/// What the renderer needs from the window it draws into.
pub trait WindowHost {
    /// Display and window handles for surface creation.
    fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)>;

    /// Current framebuffer size in pixels; `(0, 0)` while minimised.
    fn framebuffer_extent(&self) -> (u32, u32);

    /// Whether the user asked to close the window.
    fn should_close(&self) -> bool;

    /// Whether the window was resized since the flag was last cleared.
    fn resize_observed(&self) -> bool;

    /// Clear the resize flag after the swapchain has been rebuilt.
    fn clear_resize_flag(&self);

    /// Whether the framebuffer has no area.
    fn is_minimized(&self) -> bool {
        let (width, height) = self.framebuffer_extent();
        width == 0 || height == 0
    }
}

/// Close and resize flags written by the event loop.
#[derive(Debug, Default)]
pub struct WindowFlags {
    resized: AtomicBool,
    close_requested: AtomicBool,
}

impl WindowFlags {
    pub fn mark_resized(&self) {
        self.resized.store(true, Ordering::Release);
    }

    pub fn resized(&self) -> bool {
        self.resized.load(Ordering::Acquire)
    }

    pub fn clear_resized(&self) {
        self.resized.store(false, Ordering::Release);
    }

    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }
}

/// A winit window acting as [`WindowHost`].
pub struct WinitHost {
    window: Arc<Window>,
    flags: WindowFlags,
}

impl WinitHost {
    /// Open a window on a running event loop.
    pub fn create(event_loop: &ActiveEventLoop, settings: &WindowSettings) -> Result<Self> {
        let attributes = Window::default_attributes()
            .with_title(settings.title.clone())
            .with_inner_size(PhysicalSize::new(settings.width, settings.height))
            .with_resizable(settings.resizable);

        let window = event_loop
            .create_window(attributes)
            .map_err(|e| PlatformError::WindowCreation(e.to_string()))?;

        tracing::info!(
            "Opened window \"{}\" ({}x{})",
            settings.title,
            settings.width,
            settings.height
        );

        Ok(Self {
            window: Arc::new(window),
            flags: WindowFlags::default(),
        })
    }

    /// Underlying winit window.
    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// Flags written by the event loop.
    pub fn flags(&self) -> &WindowFlags {
        &self.flags
    }

    /// Ask winit for another redraw.
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

impl WindowHost for WinitHost {
    fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)> {
        let display = self
            .window
            .display_handle()
            .map_err(|e| PlatformError::Handle(e.to_string()))?;
        let window = self
            .window
            .window_handle()
            .map_err(|e| PlatformError::Handle(e.to_string()))?;
        Ok((display.as_raw(), window.as_raw()))
    }

    fn framebuffer_extent(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    fn should_close(&self) -> bool {
        self.flags.close_requested()
    }

    fn resize_observed(&self) -> bool {
        self.flags.resized()
    }

    fn clear_resize_flag(&self) {
        self.flags.clear_resized();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHost {
        extent: (u32, u32),
        flags: WindowFlags,
    }

    impl WindowHost for FixedHost {
        fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)> {
            Err(PlatformError::Handle("no window".to_string()))
        }

        fn framebuffer_extent(&self) -> (u32, u32) {
            self.extent
        }

        fn should_close(&self) -> bool {
            self.flags.close_requested()
        }

        fn resize_observed(&self) -> bool {
            self.flags.resized()
        }

        fn clear_resize_flag(&self) {
            self.flags.clear_resized();
        }
    }

    #[test]
    fn settings_follow_window_config() {
        let config = WindowConfig {
            name: "viewer".to_string(),
            width: 1024,
            height: 768,
        };
        let settings = WindowSettings::from(&config);
        assert_eq!(settings.title, "viewer");
        assert_eq!((settings.width, settings.height), (1024, 768));
        assert!(settings.resizable);
    }

    #[test]
    fn default_settings_are_800_by_600() {
        let settings = WindowSettings::default();
        assert_eq!((settings.width, settings.height), (800, 600));
    }

    #[test]
    fn resize_flag_is_sticky_until_cleared() {
        let flags = WindowFlags::default();
        assert!(!flags.resized());
        flags.mark_resized();
        flags.mark_resized();
        assert!(flags.resized());
        flags.clear_resized();
        assert!(!flags.resized());
    }

    #[test]
    fn minimized_when_either_side_is_zero() {
        for (extent, minimized) in [((0, 0), true), ((0, 600), true), ((800, 0), true), ((800, 600), false)] {
            let host = FixedHost {
                extent,
                flags: WindowFlags::default(),
            };
            assert_eq!(host.is_minimized(), minimized, "{extent:?}");
        }
    }

    #[test]
    fn close_request_is_reported() {
        let host = FixedHost {
            extent: (1, 1),
            flags: WindowFlags::default(),
        };
        assert!(!host.should_close());
        host.flags.request_close();
        assert!(host.should_close());
        assert!(host.raw_handles().is_err());
    }
}
