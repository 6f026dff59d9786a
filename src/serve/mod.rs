//! Watch mode is implemented as a three-part system:
//!
//! 1. **File watcher**: `notify` monitors the static roots of the watch rule
//!    globs recursively, with debouncing so that rapid saves trigger a
//!    single re-run.
//! 2. **WebSocket server**: dedicated threads running `tungstenite` keep
//!    the connections to open browser tabs and broadcast reload messages.
//! 3. **HTTP server**: with the `server` feature, the output directory is
//!    served over HTTP (see [`http`]).
//!
//! ## The Loop
//!
//! Debounced batches are handled one at a time. Every rule with a pattern
//! matching a changed path has its sequence re-run; changes arriving in the
//! meantime queue up in the channel and form the next batch. A successful
//! re-run notifies the browsers, a failed one is logged and the loop goes
//! on waiting.

#[cfg(feature = "server")]
pub mod http;

use std::collections::HashSet;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use notify::RecursiveMode;
use notify_debouncer_full::new_debouncer;
use tungstenite::WebSocket;

use crate::core::Mode;
use crate::engine::{Sequence, TaskContext};
use crate::error::WatchError;
use crate::pipeline::pattern::split_glob;

/// What the browser should do once a rule's sequence succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reload {
    /// Reload the whole page.
    Page,
    /// Re-fetch the stylesheets in place.
    Styles,
}

impl Reload {
    fn message(self) -> &'static str {
        match self {
            Reload::Page => "reload",
            Reload::Styles => "css",
        }
    }
}

/// Re-run `sequence` when a file matching one of `patterns` changes.
#[derive(Debug, Clone)]
pub struct WatchRule {
    patterns: Vec<String>,
    sequence: Sequence,
    reload: Option<Reload>,
}

impl WatchRule {
    pub fn new<I, S>(patterns: I, sequence: Sequence) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            sequence,
            reload: None,
        }
    }

    pub fn reload(mut self, reload: Reload) -> Self {
        self.reload = Some(reload);
        self
    }
}

/// The body of a long-running watch task.
pub struct Watch {
    rules: Vec<WatchRule>,
    serve: Option<(Utf8PathBuf, u16)>,
    debounce: Duration,
}

impl Default for Watch {
    fn default() -> Self {
        Self::new()
    }
}

impl Watch {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            serve: None,
            debounce: Duration::from_millis(250),
        }
    }

    pub fn rule(mut self, rule: WatchRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Serve `root` over HTTP on `port` while watching. Without the `server`
    /// feature this only logs a warning.
    pub fn serve(mut self, root: impl Into<Utf8PathBuf>, port: u16) -> Self {
        self.serve = Some((root.into(), port));
        self
    }

    /// Watch until the process is killed. Returns only on setup failure.
    pub fn run(&self, ctx: &TaskContext<'_>) -> Result<(), WatchError> {
        if ctx.env.mode != Mode::Watch {
            return Err(WatchError::NotWatching);
        }

        let socket = ctx.env.take_reload_socket().ok_or(WatchError::ReloadTaken)?;
        let live = LiveReload::start(socket);

        let mut watched = HashSet::new();
        let mut rules = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let mut filters = Vec::new();
            for glob in &rule.patterns {
                match resolve_watch_path(glob) {
                    Ok((path, pattern)) => {
                        watched.insert(path);
                        filters.push(pattern);
                    }
                    Err(e) => tracing::error!("failed to resolve path {glob}: {e}"),
                }
            }
            rules.push((filters, rule));
        }

        let (tx, rx) = channel();
        let mut debouncer = new_debouncer(self.debounce, None, tx)?;

        for path in collapse_watch_paths(watched) {
            tracing::info!("watching {}", path);
            debouncer.watch(&path, RecursiveMode::Recursive)?;
        }

        #[cfg(feature = "server")]
        let _thread_http = self
            .serve
            .as_ref()
            .map(|(root, port)| http::start(root.clone(), *port));

        #[cfg(not(feature = "server"))]
        if self.serve.is_some() {
            tracing::warn!("built without the `server` feature, not serving files");
        }

        loop {
            let events = match rx.recv() {
                Ok(Ok(events)) => events,
                Ok(Err(errors)) => {
                    for e in errors {
                        tracing::error!("watch error: {e}");
                    }
                    continue;
                }
                Err(_) => return Err(WatchError::Disconnected),
            };

            let paths: Vec<_> = events
                .iter()
                .filter(|de| !de.event.kind.is_access())
                .flat_map(|de| de.event.paths.iter())
                .collect();

            for (filters, rule) in &rules {
                let hit = paths
                    .iter()
                    .find(|path| filters.iter().any(|f| f.matches_path(path)));

                let Some(path) = hit else {
                    continue;
                };

                tracing::info!("{} changed, re-running...", path.display());

                match ctx.graph.run_sequence(&rule.sequence, ctx.env) {
                    Ok(()) => {
                        if let Some(reload) = rule.reload {
                            live.notify(reload);
                        }
                    }
                    Err(e) => tracing::error!("re-run failed: {e}"),
                }
            }

            tracing::info!("watching for changes...");
        }
    }
}

type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// Connected browser tabs and the thread broadcasting to them.
pub struct LiveReload {
    clients: Clients,
    tx: Sender<Reload>,
    _incoming: JoinHandle<()>,
    _outgoing: JoinHandle<()>,
}

impl LiveReload {
    pub fn start(listener: TcpListener) -> Self {
        let clients = Arc::new(Mutex::new(Vec::new()));
        let _incoming = new_thread_ws_incoming(listener, clients.clone());
        let (tx, _outgoing) = new_thread_ws_reload(clients.clone());

        Self {
            clients,
            tx,
            _incoming,
            _outgoing,
        }
    }

    pub fn notify(&self, reload: Reload) {
        if self.tx.send(reload).is_err() {
            tracing::error!("live reload thread is gone");
        }
    }

    pub fn connected(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

fn new_thread_ws_incoming(server: TcpListener, clients: Clients) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let Ok(stream) = stream else {
                continue;
            };
            match tungstenite::accept(stream) {
                Ok(socket) => clients.lock().unwrap().push(socket),
                Err(e) => tracing::warn!("rejected live reload client: {e}"),
            }
        }
    })
}

fn new_thread_ws_reload(clients: Clients) -> (Sender<Reload>, JoinHandle<()>) {
    let (tx, rx) = channel::<Reload>();

    let thread = std::thread::spawn(move || {
        for reload in rx {
            let mut clients = clients.lock().unwrap();
            clients.retain_mut(|socket| deliver(socket, reload));

            let excess = clients.len().saturating_sub(MAX_CLIENTS);
            for mut socket in clients.drain(..excess) {
                socket.close(None).ok();
            }
        }
    });

    (tx, thread)
}

/// Tabs kept connected, the oldest ones beyond this are closed.
const MAX_CLIENTS: usize = 10;

/// Send `reload` to one tab. `false` once the tab has gone away.
fn deliver(socket: &mut WebSocket<TcpStream>, reload: Reload) -> bool {
    use std::io::ErrorKind;

    match socket.send(reload.message().into()) {
        Ok(()) => true,
        Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => false,
        Err(tungstenite::Error::Io(e)) => !matches!(
            e.kind(),
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
        ),
        Err(e) => {
            tracing::warn!("live reload: {e}");
            true
        }
    }
}

/// Splits a glob string into a canonicalized static root path (for
/// watching) and a compiled absolute Pattern (for matching).
pub fn resolve_watch_path(glob: impl AsRef<str>) -> Result<(Utf8PathBuf, Pattern), WatchError> {
    let (root, suffix) = split_glob(glob.as_ref());

    // The static root has to exist on disk.
    let absolute_root = root.canonicalize_utf8()?;

    // A concrete file is matched exactly, but its parent is watched so that
    // atomic writes (write + rename) are caught.
    let (watch_root, pattern) = if suffix.as_str().is_empty() && absolute_root.is_file() {
        let parent = absolute_root
            .parent()
            .unwrap_or(&absolute_root)
            .to_path_buf();
        (parent, absolute_root)
    } else {
        let pattern = absolute_root.join(&suffix);
        (absolute_root, pattern)
    };

    let pattern = Pattern::new(escape_root(&watch_root, &pattern).as_str())?;

    Ok((watch_root, pattern))
}

/// Escape glob metacharacters in the literal root part of `pattern`.
fn escape_root(root: &Utf8Path, pattern: &Utf8Path) -> String {
    match pattern.strip_prefix(root) {
        Ok(rest) if !rest.as_str().is_empty() => {
            format!("{}/{}", Pattern::escape(root.as_str()), rest)
        }
        _ => Pattern::escape(pattern.as_str()),
    }
}

/// Watch roots covering `paths`. The watcher is recursive, so a path lying
/// inside another one adds nothing.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut sorted: Vec<_> = paths.into_iter().collect();
    sorted.sort();

    let mut roots: Vec<Utf8PathBuf> = Vec::new();
    for path in sorted {
        if !roots.last().is_some_and(|root| path.starts_with(root)) {
            roots.push(path);
        }
    }

    roots
}
