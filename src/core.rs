use std::net::TcpListener;
use std::sync::Mutex;

/// The mode in which an entry point is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A one-time build that exits when every task has finished.
    Build,
    /// A long-running session with a development server and live reload.
    Watch,
}

/// Runtime state shared by every task of one invocation.
///
/// Unlike [`Config`](crate::Config), which is fixed when the tasks are
/// constructed, the environment depends on the entry point being run: watch
/// sessions reserve a live-reload socket up front so that pages composed
/// before the server starts already know where to connect.
#[derive(Debug)]
pub struct Environment {
    /// The current mode (Build or Watch).
    pub mode: Mode,
    /// Port of the live-reload WebSocket server, if any.
    pub reload_port: Option<u16>,
    socket: Mutex<Option<TcpListener>>,
}

impl Environment {
    pub fn build() -> Self {
        Self {
            mode: Mode::Build,
            reload_port: None,
            socket: Mutex::new(None),
        }
    }

    /// Reserve the live-reload socket, preferring `port` and falling back to
    /// an ephemeral one when it is taken.
    pub fn watch(port: u16) -> std::io::Result<Self> {
        let listener = match TcpListener::bind(("127.0.0.1", port)) {
            Ok(sock) => sock,
            Err(_) => TcpListener::bind("127.0.0.1:0")?,
        };

        let port = listener.local_addr()?.port();

        Ok(Self {
            mode: Mode::Watch,
            reload_port: Some(port),
            socket: Mutex::new(Some(listener)),
        })
    }

    /// Hand the reserved socket over to the live-reload server. Only the
    /// first caller gets it.
    pub fn take_reload_socket(&self) -> Option<TcpListener> {
        self.socket.lock().unwrap().take()
    }

    /// Returns a JavaScript snippet to enable live-reloading.
    ///
    /// A `css` message re-fetches every linked stylesheet in place, any other
    /// message reloads the whole page.
    pub fn get_refresh_script(&self) -> Option<String> {
        self.reload_port.map(|port| {
            format!(
                r#"<script>
const socket = new WebSocket("ws://localhost:{port}");
socket.addEventListener("message", event => {{
    if (event.data === "css") {{
        for (const link of document.querySelectorAll('link[rel="stylesheet"]')) {{
            const url = new URL(link.href);
            url.searchParams.set("reload", Date.now());
            link.href = url.toString();
        }}
    }} else {{
        window.location.reload();
    }}
}});
</script>"#
            )
        })
    }
}
