//! Tracing subscriber setup for the `blobcat` binary

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber
///
/// Logs go to `log_file` when given, otherwise to stderr so that stdout
/// stays free for file contents. `RUST_LOG` overrides `default_level`.
pub fn init_global(log_file: Option<&Path>, default_level: tracing::Level) -> anyhow::Result<()> {
    match log_file {
        Some(path) => {
            let file = File::create(path)?;
            build_subscriber(Arc::new(file), default_level).try_init()?;
        }
        None => build_subscriber(std::io::stderr, default_level).try_init()?,
    }
    Ok(())
}

/// Build a subscriber writing to `writer`
pub fn build_subscriber<W>(writer: W, default_level: tracing::Level) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_writer(writer).with_ansi(false);

    tracing_subscriber::registry().with(fmt_layer).with(env_filter)
}
