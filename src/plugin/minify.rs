use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::core::Environment;
use crate::error::StageError;
use crate::pipeline::{Asset, Stage};

/// A script minification engine.
pub trait Minifier: Send + Sync {
    fn minify(&self, source: &str) -> Result<String, StageError>;
}

/// Minifies with the `esbuild` binary, which has to be available in `PATH`.
pub struct Esbuild;

impl Minifier for Esbuild {
    fn minify(&self, source: &str) -> Result<String, StageError> {
        let mut child = Command::new("esbuild")
            .arg("--minify")
            .arg("--loader=js")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(source.as_bytes())?;
        }

        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(StageError::Minifier(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        Ok(String::from_utf8(output.stdout).map_err(|e| e.utf8_error())?)
    }
}

/// Emits a minified copy next to every script, keeping the original:
/// `app.js` becomes `app.js` + `app-min.js`.
pub struct Minify {
    engine: Arc<dyn Minifier>,
}

impl Minify {
    pub fn new(engine: Arc<dyn Minifier>) -> Self {
        Self { engine }
    }
}

impl Stage for Minify {
    fn name(&self) -> &str {
        "minify"
    }

    fn apply(&self, _: &Environment, asset: Asset) -> Result<Vec<Asset>, StageError> {
        let minified = self.engine.minify(asset.text()?)?;

        let stem = asset.path.file_stem().unwrap_or_default();
        let name = match asset.path.extension() {
            Some(ext) => format!("{stem}-min.{ext}"),
            None => format!("{stem}-min"),
        };

        let mut min = asset.clone().with_data(minified);
        min.path.set_file_name(name);

        Ok(vec![asset, min])
    }
}
