use std::fmt::Display;
use std::fs;
use std::time::Instant;

use camino::Utf8Path;
use console::Style;

const ANSI_BLUE: Style = Style::new().blue();

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Delete the directory if it exists and create it again, empty.
pub fn clear_dir(dir: &Utf8Path) -> std::io::Result<()> {
    let s = Instant::now();

    if fs::metadata(dir).is_ok() {
        fs::remove_dir_all(dir)?;
    }

    fs::create_dir_all(dir)?;

    tracing::info!("cleaned {} {}", dir, as_overhead(s));

    Ok(())
}

/// Write `data` to `path`, creating parent directories as needed.
pub fn write_file(path: &Utf8Path, data: impl AsRef<[u8]>) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    fs::write(path, data)
}
