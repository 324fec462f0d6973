//! Core types for the Prism renderer.
//!
//! This crate provides the pieces shared by every other crate:
//! - The engine-wide error type
//! - [`Registry`], an insertion-ordered map of shared resources
//! - The TOML configuration model

pub mod config;
pub mod error;
pub mod registry;

pub use config::{Config, CullMode, FrontFace, RuntimeOptions, Version};
pub use error::{Error, Result};
pub use registry::Registry;
