use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use siphon::ext;
use siphon::follower::{spawn_stdin, FollowMode, Follower};
use siphon::parser::AccessLogParser;
use siphon::pipeline::{BulkSink, Pipeline};
use siphon::sink::{ElasticSink, StdoutSink};
use siphon::stat::{self, CarbonSink, Stat};

#[derive(Parser)]
#[command(name = "siphon")]
#[command(about = "Ship an nginx JSON access log to Elasticsearch, with carbon traffic statistics")]
struct Cli {
    /// Access log to read; "-" reads standard input (no rotation tracking)
    #[arg(default_value = "/var/log/nginx/access.json")]
    filename: String,

    /// How to read the file
    #[arg(long, value_enum, default_value_t = Mode::Tail)]
    mode: Mode,

    /// Chunk size for bulk requests
    #[arg(long, default_value_t = 500)]
    chunk_size: usize,

    /// Maximum seconds to hold an incomplete chunk before flushing
    #[arg(long, default_value_t = 10.0)]
    max_delay: f64,

    /// Retries for documents the sink throttles with 429
    #[arg(long, default_value_t = 3)]
    max_retries: usize,

    /// HTTP timeout for the index sink, seconds
    #[arg(long, default_value_t = 30.0)]
    timeout: f64,

    /// Index name strftime pattern
    #[arg(long, default_value = "nginx-%Y.%m.%d")]
    index: String,

    /// Index template file (defaults to the built-in template)
    #[arg(long)]
    template: Option<PathBuf>,

    /// Name under which the index template is installed
    #[arg(long, default_value = "nginx")]
    template_name: String,

    /// Install the index template even if one exists
    #[arg(long)]
    force_create_template: bool,

    /// Elasticsearch URL, repeatable
    #[arg(long = "elastic-url", default_value = "http://localhost:9200")]
    elastic_url: Vec<String>,

    /// Value for the bulk action _type (omitted by default; typed indices
    /// are deprecated in modern clusters)
    #[arg(long)]
    doc_type: Option<String>,

    /// Hostname stamped on documents (defaults to this machine's)
    #[arg(long)]
    hostname: Option<String>,

    /// Drop records older than this RFC 3339 timestamp
    #[arg(long)]
    min_timestamp: Option<DateTime<Utc>>,

    /// Drop records at or past this RFC 3339 timestamp
    #[arg(long)]
    max_timestamp: Option<DateTime<Utc>>,

    /// Geo-IP database path
    #[arg(long)]
    geoip: Option<PathBuf>,

    /// Post-processing extension name, repeatable
    #[arg(long = "ext")]
    ext: Vec<String>,

    /// Carbon address HOST[:PORT]; enables traffic statistics
    #[arg(long)]
    carbon: Option<String>,

    /// Send carbon metrics over UDP instead of TCP
    #[arg(long)]
    carbon_udp: bool,

    /// Statistics bucket interval, seconds
    #[arg(long, default_value_t = 10)]
    carbon_interval: u64,

    /// Grace period before a bucket is emitted, seconds
    #[arg(long, default_value_t = 10)]
    carbon_delay: u64,

    /// Metric name prefix
    #[arg(long, default_value = "nginx")]
    carbon_prefix: String,

    /// Print bulk actions as JSON instead of indexing
    #[arg(long)]
    stdout: bool,

    /// Log level for this crate (RUST_LOG overrides)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Tail,
    FromStart,
    OneShot,
}

impl From<Mode> for FollowMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Tail => FollowMode::Tail,
            Mode::FromStart => FollowMode::FromStart,
            Mode::OneShot => FollowMode::OneShot,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error!(%error, "fatal");
            std::process::exit(1);
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("siphon={}", level)));
    match format {
        LogFormat::Plain => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

/// The index pattern comes from the operator; reject a bad one before the
/// first chunk does.
fn validate_index_pattern(pattern: &str) -> Result<(), String> {
    use chrono::format::{Item, StrftimeItems};
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(format!("invalid strftime pattern {:?}", pattern));
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    validate_index_pattern(&cli.index)?;

    let hostname = match &cli.hostname {
        Some(name) => name.clone(),
        None => hostname::get()?.to_string_lossy().into_owned(),
    };

    let mut extensions = Vec::new();
    for name in &cli.ext {
        match ext::resolve(name) {
            Some(extension) => extensions.push(extension),
            None => return Err(format!("unknown extension {:?}", name).into()),
        }
    }

    let geoip = cli.geoip.as_deref().and_then(ext::open_geoip);

    let parser = AccessLogParser::new(hostname)
        .with_geoip(geoip)
        .with_extensions(extensions);

    let (stat, stat_handle) = match &cli.carbon {
        Some(addr) => {
            let sink = CarbonSink::new(addr, cli.carbon_udp)?;
            let stat = Arc::new(Stat::new(
                cli.carbon_prefix.clone(),
                cli.carbon_interval,
                cli.carbon_delay,
            ));
            let handle = stat::spawn(Arc::clone(&stat), sink);
            (Some(stat), Some(handle))
        }
        None => (None, None),
    };

    let sink: Arc<dyn BulkSink> = if cli.stdout {
        Arc::new(StdoutSink::new())
    } else {
        let elastic = ElasticSink::new(
            cli.elastic_url.clone(),
            cli.max_retries,
            Duration::from_secs_f64(cli.timeout),
        )?;
        elastic
            .ensure_template(
                &cli.template_name,
                cli.template.as_deref(),
                cli.force_create_template,
            )
            .await?;
        Arc::new(elastic)
    };

    let pipeline = Pipeline::new(
        parser,
        cli.index.clone(),
        cli.chunk_size,
        Duration::from_secs_f64(cli.max_delay),
    )
    .with_doc_type(cli.doc_type.clone())
    .with_timestamp_bounds(cli.min_timestamp, cli.max_timestamp)
    .with_stat(stat);

    let (lines, follower_shutdown, follower_handle) = if cli.filename == "-" {
        if std::env::args().any(|arg| arg == "--mode" || arg.starts_with("--mode=")) {
            warn!("--mode has no effect when reading from standard input");
        }
        let (rx, handle) = spawn_stdin(1024);
        (rx, None, handle)
    } else {
        let follower = Follower::new(&cli.filename, cli.mode.into());
        let (rx, shutdown, handle) = follower.spawn(1024);
        (rx, Some(shutdown), handle)
    };

    let mut pipeline_task = tokio::spawn(pipeline.run(lines, sink));

    let mut exit_code = 0;
    let mut reader_blocked = false;
    tokio::select! {
        result = &mut pipeline_task => {
            result??;
            info!("input exhausted, pipeline finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            exit_code = 1;
            match &follower_shutdown {
                Some(shutdown) => {
                    let _ = shutdown.send(true);
                    // the in-flight chunk is allowed to finish
                    let _ = (&mut pipeline_task).await;
                }
                None => {
                    // the stdin reader is parked in a blocking read and
                    // cannot be interrupted; don't wait on it
                    pipeline_task.abort();
                    reader_blocked = true;
                }
            }
        }
    }

    if !reader_blocked {
        match follower_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                // the follower restarts its watch pass on data-plane I/O
                // errors; an error surfacing here means it never got started
                error!(%error, "follower could not start");
                exit_code = 1;
            }
            Err(error) => {
                error!(%error, "follower task join error");
            }
        }
    }

    if let Some(handle) = stat_handle {
        handle.shutdown().await;
    }

    Ok(exit_code)
}
