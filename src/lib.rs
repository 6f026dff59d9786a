#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod config;
mod core;
pub mod engine;
mod error;
mod hash;
mod io;
pub mod pipeline;
pub mod plugin;
#[cfg(feature = "live")]
pub mod serve;
pub mod styleguide;
pub mod tasks;

pub use crate::config::Config;
pub use crate::core::{Environment, Mode};
pub use crate::engine::{Registry, Sequence, Step, TaskContext, TaskGraph};
pub use crate::error::*;
pub use crate::pipeline::{Asset, ErrorPolicy, Pipeline, Stage};
