//! CLI entry point for ssdaq.
//!
//! Subcommands:
//! - `receiver`: run a readout assembler from a deployment config file.
//! - `writer`: subscribe to a readout publisher and archive to raw files.
//! - `dump`: print decoded readouts from a file or a live subscription.
//! - `control`: send one control command to a running receiver.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use ssdaq::config::{Settings, DEFAULT_CONTROL_PORT, DEFAULT_READOUT_PORT};
use ssdaq::data::Readout;
use ssdaq::io::raw::{ContentType, RawObjectReader};
use ssdaq::io::writer::{
    FileEnumerator, ReadoutFileWriter, ReadoutWriter, WriterConfig, WriterSubscriber,
};
use ssdaq::net::ReadoutSubscriber;
use ssdaq::receiver::ReadoutAssembler;
use ssdaq::DaqError;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "ssdaq")]
#[command(about = "Slow-signal camera readout assembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a readout assembler
    Receiver {
        /// Deployment configuration file (YAML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the UDP listen address, host:port
        #[arg(long)]
        listen: Option<String>,

        /// Fold out-of-range module indices instead of failing
        #[arg(long)]
        relaxed_ip_range: bool,

        /// Override the correlation window in hardware ticks
        #[arg(long)]
        readout_window: Option<u64>,

        /// Override the buffer settle time in hardware ticks
        #[arg(long)]
        buffer_time: Option<u64>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(long)]
        verbosity: Option<String>,
    },

    /// Subscribe to a readout stream and archive it to rotating raw files
    Writer {
        /// Publisher address, host:port
        #[arg(long, default_value_t = format!("127.0.0.1:{}", DEFAULT_READOUT_PORT))]
        addr: String,

        /// Output folder
        folder: PathBuf,

        /// Filename prefix
        #[arg(long, default_value = "readouts_")]
        prefix: String,

        /// Rotate files past this size in MiB
        #[arg(long)]
        filesize_lim: Option<u64>,

        /// Compress readouts in bunches
        #[arg(long)]
        bunched: bool,
    },

    /// Print decoded readouts
    Dump {
        /// Raw readout file to read
        file: Option<PathBuf>,

        /// Publisher address to subscribe to instead of a file
        #[arg(long)]
        addr: Option<String>,

        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Send a control command to a running receiver
    Control {
        /// Command line, e.g. "set_publish_readouts false"
        command: Vec<String>,

        #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Receiver {
            config,
            listen,
            relaxed_ip_range,
            readout_window,
            buffer_time,
            verbosity,
        } => {
            run_receiver(
                config,
                listen,
                relaxed_ip_range,
                readout_window,
                buffer_time,
                verbosity,
            )
            .await
        }
        Commands::Writer {
            addr,
            folder,
            prefix,
            filesize_lim,
            bunched,
        } => run_writer(&addr, folder, prefix, filesize_lim, bunched).await,
        Commands::Dump { file, addr, limit } => dump(file, addr, limit).await,
        Commands::Control { command, port } => send_control(&command.join(" "), port).await,
    }
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

async fn run_receiver(
    config: Option<PathBuf>,
    listen: Option<String>,
    relaxed_ip_range: bool,
    readout_window: Option<u64>,
    buffer_time: Option<u64>,
    verbosity: Option<String>,
) -> Result<()> {
    let mut settings = match config {
        Some(path) => {
            let path = path.to_string_lossy().to_string();
            Settings::from_file(&path).with_context(|| format!("loading config {}", path))?
        }
        None => Settings::default_local(),
    };
    if let Some(listen) = listen {
        let (ip, port) = listen
            .rsplit_once(':')
            .context("--listen expects host:port")?;
        settings.receiver.listen_ip = ip.to_string();
        settings.receiver.listen_port = port.parse().context("--listen port")?;
    }
    if relaxed_ip_range {
        settings.receiver.relaxed_ip_range = true;
    }
    if let Some(window) = readout_window {
        settings.receiver.readout_window = window;
    }
    if let Some(time) = buffer_time {
        settings.receiver.buffer_time = time;
    }
    if let Some(level) = verbosity {
        settings.log_level = level;
    }
    init_logging(&settings.log_level);

    let mut handle = ReadoutAssembler::start(&settings)
        .await
        .context("starting readout assembler")?;
    info!("Receiver running, ctrl-c to stop");
    let fatal = handle.take_fatal();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("signal handler")?;
            info!("Stopping, flushing buffered readouts");
            handle.stop(false).await;
        }
        err = async {
            match fatal {
                Some(rx) => rx.await.ok(),
                None => std::future::pending().await,
            }
        } => {
            handle.stop(true).await;
            if let Some(e) = err {
                return Err(e).context("receiver pipeline failed");
            }
        }
    }
    Ok(())
}

async fn run_writer(
    addr: &str,
    folder: PathBuf,
    prefix: String,
    filesize_lim: Option<u64>,
    bunched: bool,
) -> Result<()> {
    init_logging("info");
    let config = WriterConfig {
        folder,
        file_prefix: prefix,
        file_ext: ".dat".to_string(),
        file_enumerator: filesize_lim.map(|_| FileEnumerator::Order),
        filesize_lim_mb: filesize_lim,
    };
    let subscriber = ReadoutSubscriber::connect(addr)
        .await
        .with_context(|| format!("connecting to publisher {}", addr))?;
    let writer_subscriber = WriterSubscriber::new(config, move |path| {
        let writer: Box<dyn ReadoutWriter> = if bunched {
            Box::new(ReadoutFileWriter::create_bunched(path)?)
        } else {
            Box::new(ReadoutFileWriter::create(path)?)
        };
        Ok(writer)
    })?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(true);
        }
    });
    let written = writer_subscriber.run(subscriber, stop_rx).await?;
    info!("Archived {} readouts from {}", written, addr);
    Ok(())
}

async fn dump(file: Option<PathBuf>, addr: Option<String>, limit: Option<usize>) -> Result<()> {
    init_logging("warn");
    match (file, addr) {
        (Some(file), None) => dump_file(&file, limit),
        (None, Some(addr)) => dump_stream(&addr, limit).await,
        _ => bail!("dump needs either a file or --addr"),
    }
}

fn dump_file(file: &PathBuf, limit: Option<usize>) -> Result<()> {
    let mut reader = RawObjectReader::open(file)?;
    println!(
        "{}: {} records, content type {:?}",
        file.display(),
        reader.n_entries(),
        reader.content_type()
    );
    let n = limit.unwrap_or(usize::MAX);
    let mut printed = 0usize;
    while printed < n {
        let chunk = match reader.read_next() {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e @ DaqError::CrcMismatch { .. }) => {
                log::warn!("Skipping record with bad checksum: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match reader.content_type() {
            Some(ContentType::Readout) => print_readout(&Readout::decode(&chunk)?),
            _ => println!("record {}: {} bytes", printed, chunk.len()),
        }
        printed += 1;
    }
    Ok(())
}

async fn dump_stream(addr: &str, limit: Option<usize>) -> Result<()> {
    let mut subscriber = ReadoutSubscriber::connect(addr)
        .await
        .with_context(|| format!("connecting to publisher {}", addr))?;
    let n = limit.unwrap_or(usize::MAX);
    let mut printed = 0usize;
    while printed < n {
        let next = tokio::select! {
            next = subscriber.recv() => next,
            _ = tokio::signal::ctrl_c() => break,
        };
        match next {
            Some(Ok(readout)) => print_readout(&readout),
            Some(Err(e)) => log::warn!("Skipping malformed readout frame: {}", e),
            None => break,
        }
        printed += 1;
    }
    subscriber.close(true);
    Ok(())
}

fn print_readout(readout: &Readout) {
    println!(
        "iro {:>8}  time {:>20}  cpu_t {:.6}  modules {}",
        readout.iro,
        readout.time,
        readout.cpu_t(),
        readout.n_contributing()
    );
}

async fn send_control(command: &str, port: u16) -> Result<()> {
    init_logging("warn");
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .with_context(|| format!("connecting to control port {}", port))?;
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(command.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await?;
    let mut lines = BufReader::new(read_half).lines();
    if let Some(reply) = lines.next_line().await? {
        println!("{}", reply);
    }
    Ok(())
}
