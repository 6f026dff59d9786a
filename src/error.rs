use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShippyError {
    #[error("Couldn't read the configuration file '{0}'.\n{1}")]
    ConfigRead(Utf8PathBuf, std::io::Error),

    #[error("Malformed configuration file '{0}'.\n{1}")]
    ConfigParse(Utf8PathBuf, toml::de::Error),

    #[error("Couldn't resolve the working directory.\n{0}")]
    WorkingDir(#[from] std::io::Error),

    #[error("Path is not valid UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Task '{0}' failed:\n{1}")]
    Task(String, anyhow::Error),

    #[error("Task '{0}' panicked: {1}")]
    Panic(String, String),
}

/// Problems with the shape of the task graph, detected before anything runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{0}' is registered twice")]
    Duplicate(String),

    #[error("Unknown task '{0}'")]
    Unknown(String),

    #[error("Task '{task}' depends on unknown task '{prerequisite}'")]
    UnknownPrerequisite { task: String, prerequisite: String },

    #[error("Sequence '{sequence}' references unknown task '{task}'")]
    UnknownStep { sequence: String, task: String },

    #[error("Cycle detected in task graph at '{0}'")]
    Cycle(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Source root '{0}' does not exist")]
    MissingRoot(Utf8PathBuf),

    #[error("IO error on '{0}': {1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("{stage} failed on '{path}':\n{source}")]
    Stage {
        stage: String,
        path: Utf8PathBuf,
        source: StageError,
    },

    #[error("{failed} of {total} files failed")]
    Partial { failed: usize, total: usize },
}

/// Failure of a single transform stage on a single file.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Sass compilation error: {0}")]
    Sass(#[from] Box<grass::Error>),

    #[error("CSS error: {0}")]
    Css(String),

    #[error("Minifier failed: {0}")]
    Minifier(String),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Malformed data: {0}")]
    Data(String),

    #[error("Couldn't serialize source map: {0}")]
    SourceMap(#[from] serde_json::Error),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error("Live reload socket was already claimed by another watch task")]
    ReloadTaken,

    #[error("Watch loop is not available in build mode")]
    NotWatching,

    #[error("File watcher disconnected")]
    Disconnected,
}
