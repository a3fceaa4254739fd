//! Watch a directory and log every event through the scribe plugin.
//!
//! Usage: cargo run --example watch_logger -- <directory>

use std::io::BufRead;

use vigil::{Observer, RawSettings, WatchSettings};

fn main() -> vigil::Result<()> {
    tracing_subscriber::fmt::init();

    let target = std::env::args().nth(1).unwrap_or_else(|| ".".to_string());

    let raw = RawSettings::new().watch(
        target.as_str(),
        WatchSettings::new()
            .with("plugins", "scribe")
            .with("scribe_log", "-"),
    );
    let mut observer = Observer::with_settings(raw)?;
    observer.start()?;
    println!("watching {target}; press Enter to stop");

    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    observer.stop();
    if let Some(message) = observer.error() {
        eprintln!("observer reported: {message}");
    }
    Ok(())
}
