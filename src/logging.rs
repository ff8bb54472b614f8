use std::fs;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes logging with console output plus a daily-rolling JSON file.
pub fn init_logging() {
    let _ = fs::create_dir_all("logs");

    let file_appender = tracing_appender::rolling::daily("logs", "ingest.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("price_scraper=info".parse().expect("valid directive")),
        )
        .with(file_layer)
        .with(console_layer)
        .init();

    // The guard must outlive the process so logs flush on exit.
    std::mem::forget(guard);
}
