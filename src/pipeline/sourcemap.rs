//! Source map emission.
//!
//! The pipeline snapshots every input before the first stage runs. After the
//! last stage each stylesheet or script gets a sibling `.map` file listing its
//! sources with their original content, and a `sourceMappingURL` comment
//! pointing at it. Stages don't report segment mappings, so `mappings` stays
//! empty: browsers still show the original sources next to the output.

use camino::Utf8Path;
use serde::Serialize;

use crate::error::StageError;
use crate::pipeline::Asset;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    version: u8,
    file: String,
    source_root: String,
    sources: Vec<String>,
    sources_content: Vec<String>,
    names: Vec<String>,
    mappings: String,
}

impl SourceMap {
    /// Snapshot of a file before any stage touched it.
    pub fn new(path: &Utf8Path, content: &[u8]) -> Self {
        Self {
            version: 3,
            file: path.file_name().unwrap_or_default().to_string(),
            source_root: "/source/".into(),
            sources: vec![path.as_str().replace('\\', "/")],
            sources_content: vec![String::from_utf8_lossy(content).into_owned()],
            names: Vec::new(),
            mappings: String::new(),
        }
    }

    /// Fold another map's sources into this one, used when files are joined.
    pub fn merge(&mut self, other: SourceMap) {
        for (source, content) in other.sources.into_iter().zip(other.sources_content) {
            if !self.sources.contains(&source) {
                self.sources.push(source);
                self.sources_content.push(content);
            }
        }
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }
}

/// Which comment syntax the output format understands.
fn comment(path: &Utf8Path, url: &str) -> Option<String> {
    match path.extension() {
        Some("css") => Some(format!("\n/*# sourceMappingURL={url} */\n")),
        Some("js") => Some(format!("\n//# sourceMappingURL={url}\n")),
        _ => None,
    }
}

/// Attach the map to `asset`, returning the map file as a second asset.
/// Assets that can't carry a comment just drop their map.
pub(crate) fn write(mut asset: Asset) -> Result<Vec<Asset>, StageError> {
    let Some(mut map) = asset.map.take() else {
        return Ok(vec![asset]);
    };

    let map_path = asset.path.with_extension(match asset.path.extension() {
        Some(ext) => format!("{ext}.map"),
        None => "map".to_string(),
    });
    let url = map_path.file_name().unwrap_or_default().to_string();

    let Some(comment) = comment(&asset.path, &url) else {
        return Ok(vec![asset]);
    };

    map.file = asset.path.file_name().unwrap_or_default().to_string();

    let json = serde_json::to_vec(&map)?;
    asset.data.extend_from_slice(comment.as_bytes());

    let map_asset = Asset {
        source: asset.source.clone(),
        path: map_path,
        data: json,
        map: None,
    };

    Ok(vec![asset, map_asset])
}
