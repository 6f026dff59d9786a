use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use lightningcss::targets::{Browsers, Targets};

use crate::config::BrowserTargets;
use crate::core::Environment;
use crate::error::StageError;
use crate::pipeline::{Asset, Stage};

/// Adds vendor prefixes for the configured browsers and optionally minifies,
/// using `lightningcss`.
pub struct Prefix {
    browsers: Browsers,
    minify: bool,
}

impl Prefix {
    pub fn new(targets: &BrowserTargets, minify: bool) -> Self {
        // lightningcss encodes versions as `major << 16 | minor << 8`
        let version = |major: Option<u32>| major.map(|major| major << 16);

        Self {
            browsers: Browsers {
                chrome: version(targets.chrome),
                firefox: version(targets.firefox),
                safari: version(targets.safari),
                edge: version(targets.edge),
                ie: version(targets.ie),
                ..Browsers::default()
            },
            minify,
        }
    }
}

impl Stage for Prefix {
    fn name(&self) -> &str {
        "prefix"
    }

    fn apply(&self, _: &Environment, asset: Asset) -> Result<Vec<Asset>, StageError> {
        let code = {
            let text = asset.text()?;

            let mut sheet = StyleSheet::parse(
                text,
                ParserOptions {
                    filename: asset.path.to_string(),
                    ..ParserOptions::default()
                },
            )
            .map_err(|e| StageError::Css(e.to_string()))?;

            sheet
                .minify(MinifyOptions {
                    targets: Targets::from(self.browsers),
                    ..MinifyOptions::default()
                })
                .map_err(|e| StageError::Css(e.to_string()))?;

            sheet
                .to_css(PrinterOptions {
                    minify: self.minify,
                    targets: Targets::from(self.browsers),
                    ..PrinterOptions::default()
                })
                .map_err(|e| StageError::Css(e.to_string()))?
                .code
        };

        Ok(vec![asset.with_data(code)])
    }
}
