use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::constants::LOG_FILE_ENV;

pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Install the global subscriber. `RUST_LOG` overrides `default_directive`.
pub fn init_tracing_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let registry = tracing_subscriber::registry().with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter),
    );

    let Some(log_path) = std::env::var(LOG_FILE_ENV).ok() else {
        registry.init();
        return;
    };

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let file_layer = fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(LevelFilter::DEBUG);
            registry.with(file_layer).init();
            eprintln!("File logging enabled: {}", log_path);
        }
        Err(e) => {
            registry.init();
            tracing::warn!(path = %log_path, error = %e, "Failed to open log file");
        }
    }
}
