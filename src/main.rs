use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use file_reader::host::{MemoryFile, MemoryHostConfig, MemoryScriptHost};
use file_reader::{ReaderConfig, TransferPreference};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Stream local files through the chunked script-side file reader
#[derive(Parser, Debug)]
#[command(name = "blobcat")]
#[command(version, about)]
struct Args {
    /// Files to stage on a file input
    #[arg(value_name = "FILES", required = true)]
    files: Vec<PathBuf>,

    /// Transfer mode (overrides the configuration file)
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Pretend the script runtime cannot share buffers
    #[arg(long)]
    no_shared_buffer: bool,

    /// Index of the file to print
    #[arg(long, default_value_t = 0)]
    index: usize,

    /// Byte offset to start at; negative counts from the end
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    offset: i64,

    /// Number of bytes to print (default: to end of file)
    #[arg(long)]
    length: Option<u64>,

    /// Largest single read request, in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Delay each read callback by this many milliseconds
    #[arg(long, value_name = "MS", default_value_t = 0)]
    callback_delay: u64,

    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to log file (default: stderr)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,

    /// List the staged files instead of printing one
    #[arg(long)]
    list: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Auto,
    SharedBuffer,
    Encoded,
}

impl From<ModeArg> for TransferPreference {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => TransferPreference::Auto,
            ModeArg::SharedBuffer => TransferPreference::SharedBuffer,
            ModeArg::Encoded => TransferPreference::Encoded,
        }
    }
}

fn load_config(args: &Args) -> Result<ReaderConfig> {
    let mut config = match &args.config {
        Some(path) => ReaderConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ReaderConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.transfer_mode = mode.into();
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    file_reader::tracing_setup::init_global(args.log_file.as_deref(), level)?;

    let config = load_config(&args)?;

    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        files.push(MemoryFile::from_path(path).await?);
    }

    let host = MemoryScriptHost::new(MemoryHostConfig {
        shared_buffer: !args.no_shared_buffer,
        callback_delay: Duration::from_millis(args.callback_delay),
    });
    let input = host.add_input(files);
    let reader = host.reader(config)?;
    tracing::info!("reading with {} transfer", reader.transfer_mode());

    let mut stdout = tokio::io::stdout();

    if args.list {
        let count = reader.get_file_count(input).await?.unwrap_or(0);
        for index in 0..count {
            let Some(info) = reader.get_file_info_from_element(input, index).await? else {
                continue;
            };
            let modified = info
                .last_modified_utc()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            let line = format!(
                "{}\t{}\t{}\t{}\t{}\n",
                index,
                info.size,
                if info.mime_type.is_empty() { "-" } else { &info.mime_type },
                modified,
                info.name
            );
            stdout.write_all(line.as_bytes()).await?;
        }
        stdout.flush().await?;
        return Ok(());
    }

    let mut stream = reader.open_file_stream(input, args.index).await?;
    let start = if args.offset < 0 {
        SeekFrom::End(args.offset)
    } else {
        SeekFrom::Start(args.offset as u64)
    };
    if let Err(e) = stream.seek(start) {
        bail!("cannot seek to {}: {}", args.offset, e);
    }

    let copied = match args.length {
        Some(length) => tokio::io::copy(&mut (&mut stream).take(length), &mut stdout).await?,
        None => tokio::io::copy(&mut stream, &mut stdout).await?,
    };
    stdout.flush().await?;
    tracing::debug!("copied {} bytes from '{}'", copied, stream.info().name);

    stream.dispose().await?;
    Ok(())
}
