//! Project configuration.
//!
//! Every task is constructed from a single [`Config`] value. The values can be
//! overridden by a `Shippy.toml` file; any key left out keeps the default,
//! which mirrors the conventional `src` -> `dist` project layout.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ShippyError;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "Shippy.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Source root with assets, pages, layouts, partials, helpers and data.
    pub src: Utf8PathBuf,
    /// Build output root.
    pub dist: Utf8PathBuf,
    /// Static files copied into the style guide.
    #[serde(rename = "static")]
    pub static_dir: Utf8PathBuf,
    /// Persistent cache for optimized images.
    pub cache: Utf8PathBuf,
    /// Emit source maps for stylesheets and scripts.
    pub sourcemaps: bool,
    pub styles: StylesConfig,
    pub scripts: ScriptsConfig,
    pub images: ImagesConfig,
    pub server: ServerConfig,
    pub styleguide: StyleguideConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputStyle {
    #[default]
    Expanded,
    Compressed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StylesConfig {
    pub output_style: OutputStyle,
    /// Run the prefixing stage in minifying mode.
    pub minify: bool,
    /// Oldest browser versions to prefix for, as `major` numbers.
    pub targets: BrowserTargets,
}

impl Default for StylesConfig {
    fn default() -> Self {
        Self {
            output_style: OutputStyle::Expanded,
            minify: true,
            targets: BrowserTargets::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrowserTargets {
    pub chrome: Option<u32>,
    pub firefox: Option<u32>,
    pub safari: Option<u32>,
    pub edge: Option<u32>,
    pub ie: Option<u32>,
}

impl Default for BrowserTargets {
    fn default() -> Self {
        Self {
            chrome: Some(60),
            firefox: Some(60),
            safari: Some(11),
            edge: Some(16),
            ie: Some(11),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MinifierKind {
    #[default]
    Esbuild,
    None,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptsConfig {
    pub minifier: MinifierKind,
    /// Join every script into this file (relative to the scripts output).
    pub concat: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagesConfig {
    /// PNG optimization level, 0-6.
    pub png_level: u8,
    pub jpeg_quality: u8,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            png_level: 5,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    pub reload_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            reload_port: 1337,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StyleguideConfig {
    pub title: String,
    /// Output root of the generated style guide.
    pub output: Utf8PathBuf,
    /// Markdown file rendered on the overview page.
    pub overview: Utf8PathBuf,
    /// Raw HTML inserted into `<head>` of every page. `{root}` expands to
    /// the asset root of the current mode.
    pub extra_head: Vec<String>,
    pub show_reference_numbers: bool,
    /// Publishing mode: relative asset paths instead of absolute ones.
    pub frozen: bool,
}

impl Default for StyleguideConfig {
    fn default() -> Self {
        Self {
            title: "Shippy Styleguide".into(),
            output: "styleguide".into(),
            overview: "README.md".into(),
            extra_head: vec![r#"<script src="{root}static/js/app.js"></script>"#.into()],
            show_reference_numbers: true,
            frozen: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            src: "src".into(),
            dist: "dist".into(),
            static_dir: "static".into(),
            cache: ".cache".into(),
            sourcemaps: true,
            styles: StylesConfig::default(),
            scripts: ScriptsConfig::default(),
            images: ImagesConfig::default(),
            server: ServerConfig::default(),
            styleguide: StyleguideConfig::default(),
        }
    }
}

impl Config {
    /// Load the configuration from `path`, or from [`CONFIG_FILE`] in the
    /// working directory when it exists. Relative paths are anchored at the
    /// directory holding the file.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, ShippyError> {
        let cwd = Utf8PathBuf::try_from(std::env::current_dir()?)?;

        let file = match path {
            Some(path) => Some(cwd.join(path)),
            None => {
                let candidate = cwd.join(CONFIG_FILE);
                candidate.is_file().then_some(candidate)
            }
        };

        let Some(file) = file else {
            return Ok(Config::default().anchored(&cwd));
        };

        let text =
            fs::read_to_string(&file).map_err(|e| ShippyError::ConfigRead(file.clone(), e))?;
        let config = Self::from_toml(&text).map_err(|e| ShippyError::ConfigParse(file.clone(), e))?;

        let root = file.parent().map(Utf8Path::to_path_buf).unwrap_or(cwd);
        Ok(config.anchored(&root))
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Make every relative path absolute against `root`.
    pub fn anchored(mut self, root: &Utf8Path) -> Self {
        for path in [
            &mut self.src,
            &mut self.dist,
            &mut self.static_dir,
            &mut self.cache,
            &mut self.styleguide.output,
            &mut self.styleguide.overview,
        ] {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }
        self
    }

    pub fn assets(&self) -> Utf8PathBuf {
        self.src.join("assets")
    }

    pub fn dist_assets(&self) -> Utf8PathBuf {
        self.dist.join("assets")
    }
}
