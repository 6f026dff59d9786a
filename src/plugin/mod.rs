//! Transform stages backed by external engines.

pub mod compose;
pub mod image;
pub mod minify;
pub mod prefix;
pub mod sass;

pub use compose::{Compose, Composer};
pub use image::{Compressor, ImageCache, ImageOptimizer, Optimize};
pub use minify::{Esbuild, Minifier, Minify};
pub use prefix::Prefix;
pub use sass::Sass;
