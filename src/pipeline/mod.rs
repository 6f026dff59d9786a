//! The file pipeline primitive: select files by glob, push each one through
//! an ordered chain of stages, write whatever survives to a destination
//! directory, keeping the path relative to the glob's static prefix.

pub mod pattern;
pub mod sourcemap;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use glob::glob;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::core::Environment;
use crate::error::{PipelineError, StageError};
use crate::pipeline::pattern::glob_base;
use crate::pipeline::sourcemap::SourceMap;

/// A single file flowing through a pipeline.
#[derive(Debug, Clone)]
pub struct Asset {
    /// Absolute path of the file this asset was read from.
    pub source: Utf8PathBuf,
    /// Output path, relative to the destination directory.
    pub path: Utf8PathBuf,
    pub data: Vec<u8>,
    pub(crate) map: Option<SourceMap>,
}

impl Asset {
    pub fn text(&self) -> Result<&str, StageError> {
        Ok(std::str::from_utf8(&self.data)?)
    }

    /// Replace the content, keeping path and source map.
    pub fn with_data(self, data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..self
        }
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.path.set_extension(ext);
        self
    }
}

/// One transform applied to every file of a pipeline.
///
/// A stage may rename a file, replace its content, drop it (empty vector) or
/// fan it out into several files.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, env: &Environment, asset: Asset) -> Result<Vec<Asset>, StageError>;
}

/// Adapter turning a closure into a [`Stage`].
pub struct FnStage<F> {
    name: &'static str,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(Asset) -> Result<Asset, StageError> + Send + Sync,
{
    pub fn new(name: &'static str, func: F) -> Self {
        Self { name, func }
    }
}

impl<F> Stage for FnStage<F>
where
    F: Fn(Asset) -> Result<Asset, StageError> + Send + Sync,
{
    fn name(&self) -> &str {
        self.name
    }

    fn apply(&self, _: &Environment, asset: Asset) -> Result<Vec<Asset>, StageError> {
        Ok(vec![(self.func)(asset)?])
    }
}

/// What happens when a stage fails on one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Write nothing if any file failed.
    #[default]
    Abort,
    /// Write every file that made it through, then report the failures.
    Continue,
}

/// Files written by a successful run.
#[derive(Debug, Default)]
pub struct Report {
    pub written: Vec<Utf8PathBuf>,
}

pub struct Pipeline {
    name: String,
    root: Option<Utf8PathBuf>,
    sources: Vec<String>,
    stages: Vec<Arc<dyn Stage>>,
    finish: Vec<Arc<dyn Stage>>,
    dest: Utf8PathBuf,
    policy: ErrorPolicy,
    sourcemaps: bool,
    concat: Option<Utf8PathBuf>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: None,
            sources: Vec::new(),
            stages: Vec::new(),
            finish: Vec::new(),
            dest: Utf8PathBuf::new(),
            policy: ErrorPolicy::default(),
            sourcemaps: false,
            concat: None,
        }
    }

    /// Directory that must exist for the pipeline to run at all.
    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn src(mut self, glob: impl AsRef<str>) -> Self {
        self.sources.push(glob.as_ref().to_string());
        self
    }

    pub fn stage(self, stage: impl Stage + 'static) -> Self {
        self.stage_arc(Arc::new(stage))
    }

    pub fn stage_arc(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stage applied after concatenation, to the joined file.
    pub fn finish(mut self, stage: impl Stage + 'static) -> Self {
        self.finish.push(Arc::new(stage));
        self
    }

    pub fn dest(mut self, dest: impl Into<Utf8PathBuf>) -> Self {
        self.dest = dest.into();
        self
    }

    pub fn policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn sourcemaps(mut self, enabled: bool) -> Self {
        self.sourcemaps = enabled;
        self
    }

    /// Join every output into a single file at `path`.
    pub fn concat(mut self, path: Option<impl Into<Utf8PathBuf>>) -> Self {
        self.concat = path.map(Into::into);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expand the source globs. Globs are resolved on every call.
    pub fn files(&self) -> Result<BTreeMap<Utf8PathBuf, Utf8PathBuf>, PipelineError> {
        if let Some(root) = &self.root
            && !root.is_dir()
        {
            return Err(PipelineError::MissingRoot(root.clone()));
        }

        let mut files = BTreeMap::new();

        for pattern in &self.sources {
            let base = glob_base(pattern);
            if !base.is_dir() {
                tracing::warn!("{}: '{}' does not exist, nothing to do", self.name, base);
                continue;
            }

            for path in glob(pattern)? {
                let path = Utf8PathBuf::try_from(path?)?;
                if !path.is_file() || files.contains_key(&path) {
                    continue;
                }

                let relative = path
                    .strip_prefix(&base)
                    .map(Utf8Path::to_path_buf)
                    .unwrap_or_else(|_| path.file_name().unwrap_or_default().into());

                files.insert(path, relative);
            }
        }

        Ok(files)
    }

    fn process(
        &self,
        env: &Environment,
        source: Utf8PathBuf,
        path: Utf8PathBuf,
    ) -> Result<Vec<Asset>, PipelineError> {
        let data = fs::read(&source).map_err(|e| PipelineError::Io(source.clone(), e))?;

        let map = self.sourcemaps.then(|| SourceMap::new(&path, &data));
        let asset = Asset {
            source,
            path,
            data,
            map,
        };

        apply_stages(env, &self.stages, vec![asset])
    }

    /// Run the pipeline once.
    pub fn run(&self, env: &Environment) -> Result<Report, PipelineError> {
        let s = Instant::now();
        let files = self.files()?;
        let total = files.len();

        if total == 0 {
            tracing::warn!("{}: no files matched {:?}", self.name, self.sources);
        }

        let results: Vec<_> = files
            .into_par_iter()
            .map(|(source, path)| self.process(env, source, path))
            .collect();

        let mut assets = Vec::new();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(out) => assets.extend(out),
                Err(err) => {
                    tracing::error!("{}: {}", self.name, err);
                    errors.push(err);
                }
            }
        }

        if self.policy == ErrorPolicy::Abort && !errors.is_empty() {
            return Err(errors.swap_remove(0));
        }

        if let Some(target) = &self.concat
            && !assets.is_empty()
        {
            assets = vec![concat(target, assets)];
        }

        let assets = apply_stages(env, &self.finish, assets)?;

        let mut written = Vec::new();
        for asset in assets {
            let source = asset.source.clone();
            for asset in sourcemap::write(asset).map_err(|e| PipelineError::Stage {
                stage: "sourcemaps".into(),
                path: source.clone(),
                source: e,
            })? {
                let path = self.dest.join(&asset.path);
                crate::io::write_file(&path, &asset.data)
                    .map_err(|e| PipelineError::Io(path.clone(), e))?;
                written.push(path);
            }
        }

        tracing::info!(
            "{}: wrote {} files {}",
            self.name,
            written.len(),
            crate::io::as_overhead(s)
        );

        match self.policy {
            ErrorPolicy::Continue if !errors.is_empty() => Err(PipelineError::Partial {
                failed: errors.len(),
                total,
            }),
            _ => Ok(Report { written }),
        }
    }
}

fn apply_stages(
    env: &Environment,
    stages: &[Arc<dyn Stage>],
    mut assets: Vec<Asset>,
) -> Result<Vec<Asset>, PipelineError> {
    for stage in stages {
        let mut next = Vec::with_capacity(assets.len());
        for asset in assets {
            let path = asset.source.clone();
            let out = stage
                .apply(env, asset)
                .map_err(|source| PipelineError::Stage {
                    stage: stage.name().to_string(),
                    path,
                    source,
                })?;
            next.extend(out);
        }
        assets = next;
    }

    Ok(assets)
}

fn concat(target: &Utf8Path, assets: Vec<Asset>) -> Asset {
    let mut data = Vec::new();
    let mut map: Option<SourceMap> = None;
    let mut source = Utf8PathBuf::new();

    for asset in assets {
        if !data.is_empty() && !data.ends_with(b"\n") {
            data.push(b'\n');
        }
        data.extend_from_slice(&asset.data);
        if source.as_str().is_empty() {
            source = asset.source;
        }
        match (&mut map, asset.map) {
            (Some(acc), Some(next)) => acc.merge(next),
            (None, Some(next)) => map = Some(next),
            _ => {}
        }
    }

    Asset {
        source,
        path: target.to_path_buf(),
        data,
        map,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Fixture {
        fn new(files: &[(&str, &str)]) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
            for (path, text) in files {
                crate::io::write_file(&root.join(path), text).unwrap();
            }
            Self { _tmp: tmp, root }
        }

        fn read(&self, path: &str) -> String {
            fs::read_to_string(self.root.join(path)).unwrap()
        }
    }

    fn upper() -> FnStage<impl Fn(Asset) -> Result<Asset, StageError> + Send + Sync> {
        FnStage::new("upper", |asset: Asset| {
            let text = asset.text()?.to_uppercase();
            Ok(asset.with_data(text))
        })
    }

    fn reject_bad() -> FnStage<impl Fn(Asset) -> Result<Asset, StageError> + Send + Sync> {
        FnStage::new("reject", |asset: Asset| {
            if asset.text()?.contains("bad") {
                Err(StageError::Css("bad input".into()))
            } else {
                Ok(asset)
            }
        })
    }

    #[test]
    fn keeps_relative_structure() {
        let fx = Fixture::new(&[("src/a.txt", "a"), ("src/nested/deep/b.txt", "b")]);

        Pipeline::new("copy")
            .src(fx.root.join("src/**/*.txt"))
            .dest(fx.root.join("dist"))
            .run(&Environment::build())
            .unwrap();

        assert_eq!(fx.read("dist/a.txt"), "a");
        assert_eq!(fx.read("dist/nested/deep/b.txt"), "b");
    }

    #[test]
    fn stages_apply_in_order() {
        let fx = Fixture::new(&[("src/a.txt", "abc")]);

        Pipeline::new("upper")
            .src(fx.root.join("src/*.txt"))
            .stage(upper())
            .stage(FnStage::new("ext", |a: Asset| Ok(a.with_extension("out"))))
            .dest(fx.root.join("dist"))
            .run(&Environment::build())
            .unwrap();

        assert_eq!(fx.read("dist/a.out"), "ABC");
    }

    #[test]
    fn abort_writes_nothing() {
        let fx = Fixture::new(&[("src/good.css", "good"), ("src/broken.css", "bad")]);

        let err = Pipeline::new("styles")
            .src(fx.root.join("src/*.css"))
            .stage(reject_bad())
            .dest(fx.root.join("dist"))
            .policy(ErrorPolicy::Abort)
            .run(&Environment::build())
            .unwrap_err();

        assert!(matches!(err, PipelineError::Stage { ref stage, .. } if stage == "reject"));
        assert!(!fx.root.join("dist").exists());
    }

    #[test]
    fn continue_writes_survivors_and_fails() {
        let fx = Fixture::new(&[("src/good.css", "good"), ("src/broken.css", "bad")]);

        let err = Pipeline::new("images")
            .src(fx.root.join("src/*.css"))
            .stage(reject_bad())
            .dest(fx.root.join("dist"))
            .policy(ErrorPolicy::Continue)
            .run(&Environment::build())
            .unwrap_err();

        assert!(matches!(err, PipelineError::Partial { failed: 1, total: 2 }));
        assert_eq!(fx.read("dist/good.css"), "good");
        assert!(!fx.root.join("dist/broken.css").exists());
    }

    #[test]
    fn glob_characters_in_the_root_are_literal() {
        let fx = Fixture::new(&[("site [v2]/src/nested/a.txt", "a")]);
        let src = fx.root.join("site [v2]/src");

        Pipeline::new("copy")
            .root(&src)
            .src(format!("{}/**/*.txt", glob::Pattern::escape(src.as_str())))
            .dest(fx.root.join("dist"))
            .run(&Environment::build())
            .unwrap();

        assert_eq!(fx.read("dist/nested/a.txt"), "a");
    }

    #[test]
    fn globs_are_resolved_on_every_run() {
        let fx = Fixture::new(&[("src/a.txt", "a")]);
        let pipeline = Pipeline::new("copy")
            .src(fx.root.join("src/*.txt"))
            .dest(fx.root.join("dist"));

        assert_eq!(pipeline.run(&Environment::build()).unwrap().written.len(), 1);

        crate::io::write_file(&fx.root.join("src/b.txt"), "b").unwrap();
        assert_eq!(pipeline.run(&Environment::build()).unwrap().written.len(), 2);
    }

    #[test]
    fn overlapping_globs_process_files_once() {
        let fx = Fixture::new(&[("src/a.txt", "a")]);

        let report = Pipeline::new("copy")
            .src(fx.root.join("src/*.txt"))
            .src(fx.root.join("src/a.txt"))
            .dest(fx.root.join("dist"))
            .run(&Environment::build())
            .unwrap();

        assert_eq!(report.written.len(), 1);
    }

    #[test]
    fn missing_subtree_matches_nothing() {
        let fx = Fixture::new(&[("src/a.txt", "a")]);

        let report = Pipeline::new("media")
            .root(fx.root.join("src"))
            .src(fx.root.join("src/video/**/*"))
            .dest(fx.root.join("dist"))
            .run(&Environment::build())
            .unwrap();

        assert!(report.written.is_empty());
    }

    #[test]
    fn missing_root_is_fatal() {
        let fx = Fixture::new(&[]);

        let err = Pipeline::new("media")
            .root(fx.root.join("src"))
            .src(fx.root.join("src/video/**/*"))
            .dest(fx.root.join("dist"))
            .run(&Environment::build())
            .unwrap_err();

        assert!(matches!(err, PipelineError::MissingRoot(_)));
    }

    #[test]
    fn sourcemaps_are_a_toggle() {
        let fx = Fixture::new(&[("src/app.js", "let a = 1;")]);
        let run = |enabled: bool, out: &str| {
            Pipeline::new("scripts")
                .src(fx.root.join("src/app.js"))
                .dest(fx.root.join(out))
                .sourcemaps(enabled)
                .run(&Environment::build())
                .unwrap()
        };

        assert_eq!(run(true, "on").written.len(), 2);
        assert!(fx.read("on/app.js").contains("sourceMappingURL=app.js.map"));
        assert!(fx.read("on/app.js.map").contains("let a = 1;"));

        assert_eq!(run(false, "off").written.len(), 1);
        assert_eq!(fx.read("off/app.js"), "let a = 1;");
    }

    #[test]
    fn concat_joins_in_path_order() {
        let fx = Fixture::new(&[("src/b.js", "b()"), ("src/a.js", "a()")]);

        Pipeline::new("scripts")
            .src(fx.root.join("src/*.js"))
            .dest(fx.root.join("dist"))
            .concat(Some("bundle.js"))
            .sourcemaps(true)
            .run(&Environment::build())
            .unwrap();

        let text = fx.read("dist/bundle.js");
        assert!(text.starts_with("a()\nb()"));
        assert!(!fx.root.join("dist/a.js").exists());

        let map: serde_json::Value =
            serde_json::from_str(&fx.read("dist/bundle.js.map")).unwrap();
        assert_eq!(map["sources"], serde_json::json!(["a.js", "b.js"]));
    }

    #[test]
    fn finish_stages_see_the_joined_file() {
        let fx = Fixture::new(&[("src/a.js", "a()"), ("src/b.js", "b()")]);

        let report = Pipeline::new("scripts")
            .src(fx.root.join("src/*.js"))
            .dest(fx.root.join("dist"))
            .concat(Some("app.js"))
            .finish(upper())
            .run(&Environment::build())
            .unwrap();

        assert_eq!(report.written.len(), 1);
        assert_eq!(fx.read("dist/app.js"), "A()\nB()");
    }
}
