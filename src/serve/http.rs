use std::{net::SocketAddr, thread};

use axum::Router;
use camino::Utf8PathBuf;
use console::style;
use tower_http::services::ServeDir;
use tracing::info;

/// Serve `root` on `localhost:port` from a dedicated thread.
pub fn start(root: Utf8PathBuf, port: u16) -> thread::JoinHandle<Result<(), anyhow::Error>> {
    info!(url = %style(format!("http://localhost:{port}/")).yellow(), root = %root, "starting a HTTP server");

    thread::spawn(move || {
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(anyhow::Error::from)
            .and_then(|runtime| runtime.block_on(serve(root, port)));

        if let Err(e) = &result {
            tracing::error!("HTTP server stopped: {e}");
        }

        result
    })
}

async fn serve(root: Utf8PathBuf, port: u16) -> Result<(), anyhow::Error> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let address = tokio::net::TcpListener::bind(address).await?;

    let router = Router::new().fallback_service(ServeDir::new(root));

    axum::serve(address, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn serves_files_from_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        crate::io::write_file(&root.join("index.html"), "<h1>hello</h1>").unwrap();

        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let _server = start(root, port);

        let s = Instant::now();
        let mut stream = loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => break stream,
                Err(_) if s.elapsed() < Duration::from_secs(5) => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                Err(e) => panic!("server did not start: {e}"),
            }
        };

        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("<h1>hello</h1>"));
    }
}
