use camino::Utf8PathBuf;

use crate::config::OutputStyle;
use crate::core::Environment;
use crate::error::StageError;
use crate::pipeline::{Asset, Stage};

/// Compiles Sass/SCSS to CSS with `grass`.
///
/// The stage compiles the asset's source file, so it has to come first in a
/// pipeline; compilation errors then point at the file and line. Partials
/// (file names starting with `_`) are only meant to be imported, so they are
/// dropped from the output.
pub struct Sass {
    style: OutputStyle,
    load_paths: Vec<Utf8PathBuf>,
}

impl Sass {
    pub fn new(style: OutputStyle) -> Self {
        Self {
            style,
            load_paths: Vec::new(),
        }
    }

    /// Extra directory searched by `@use` and `@import`.
    pub fn load_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.load_paths.push(path.into());
        self
    }
}

impl Stage for Sass {
    fn name(&self) -> &str {
        "sass"
    }

    fn apply(&self, _: &Environment, asset: Asset) -> Result<Vec<Asset>, StageError> {
        if asset
            .path
            .file_name()
            .is_some_and(|name| name.starts_with('_'))
        {
            return Ok(vec![]);
        }

        let style = match self.style {
            OutputStyle::Expanded => grass::OutputStyle::Expanded,
            OutputStyle::Compressed => grass::OutputStyle::Compressed,
        };

        let mut options = grass::Options::default().style(style);
        for path in &self.load_paths {
            options = options.load_path(path);
        }

        let css = grass::from_path(&asset.source, &options)?;

        Ok(vec![asset.with_data(css).with_extension("css")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sources {
        _tmp: tempfile::TempDir,
        dir: Utf8PathBuf,
    }

    impl Sources {
        fn new(files: &[(&str, &str)]) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
            for (name, text) in files {
                crate::io::write_file(&dir.join(name), text).unwrap();
            }
            Self { _tmp: tmp, dir }
        }

        fn compile(&self, sass: &Sass, name: &str) -> Result<Vec<Asset>, StageError> {
            let source = self.dir.join(name);
            let asset = Asset {
                data: std::fs::read(&source).unwrap_or_default(),
                source,
                path: name.into(),
                map: None,
            };
            sass.apply(&Environment::build(), asset)
        }
    }

    #[test]
    fn compiles_nested_rules() {
        let src = Sources::new(&[("app.scss", "$c: red; .a { .b { color: $c; } }")]);

        let out = src.compile(&Sass::new(OutputStyle::Expanded), "app.scss").unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, "app.css");
        let css = out[0].text().unwrap();
        assert!(css.contains(".a .b"));
        assert!(css.contains("color: red"));
    }

    #[test]
    fn resolves_imports_next_to_the_source() {
        let src = Sources::new(&[
            ("_vars.scss", "$accent: #00f;"),
            ("app.scss", "@import 'vars'; a { color: $accent; }"),
        ]);

        let out = src.compile(&Sass::new(OutputStyle::Compressed), "app.scss").unwrap();

        assert!(out[0].text().unwrap().contains("color:#00f"));
    }

    #[test]
    fn resolves_imports_from_load_paths() {
        let src = Sources::new(&[
            ("shared/_theme.scss", "$bg: #fff;"),
            ("pages/app.scss", "@import 'theme'; body { background: $bg; }"),
        ]);
        let sass = Sass::new(OutputStyle::Compressed).load_path(src.dir.join("shared"));

        let out = src.compile(&sass, "pages/app.scss").unwrap();

        assert!(out[0].text().unwrap().contains("background:#fff"));
    }

    #[test]
    fn partials_are_skipped() {
        let src = Sources::new(&[("_vars.scss", "$a: 1;")]);

        let out = src.compile(&Sass::new(OutputStyle::Expanded), "_vars.scss").unwrap();

        assert!(out.is_empty());
    }

    #[test]
    fn syntax_errors_name_the_file() {
        let src = Sources::new(&[("broken.scss", "a { color: red")]);

        let err = src
            .compile(&Sass::new(OutputStyle::Expanded), "broken.scss")
            .unwrap_err();

        assert!(matches!(err, StageError::Sass(_)));
        assert!(err.to_string().contains("broken.scss"));
    }
}
