//! dnswatch - DNS send tracing
//!
//! Attributes every DNS datagram a host sends to the process that sent it,
//! with the command line the process was started with.

use clap::{Args, Parser, Subcommand};
use dnswatch_capture::{EventFilter, SyntheticCapture, SyntheticConfig};
use dnswatch_capture_ebpf::loader::{
    check_ebpf_available, get_kernel_version, has_btf, is_root, resolve_interceptor,
};
use dnswatch_capture_ebpf::{EbpfCapture, EbpfCaptureConfig};
use dnswatch_core::config::CaptureSettings;
use dnswatch_core::{
    AttachMode, CaptureBackend, ConfigLoader, DnsSendRecord, DnswatchConfig, MetricsCollector,
    OutputFormat,
};
use dnswatch_ebpf_common::FnId;
use dnswatch_export::{
    call_line, parse_fields, serve_metrics, JsonlExporter, JsonlExporterConfig, RecordSink,
    TextPrinter, TopAggregator,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "dnswatch")]
#[command(version)]
#[command(about = "Trace DNS sends back to the processes that made them", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "DNSWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Capture options shared by the live subcommands
#[derive(Args, Debug, Default)]
struct CaptureArgs {
    /// Only show records from these thread ids
    #[arg(long)]
    pid: Vec<u32>,

    /// Only show records from these processes (thread group ids)
    #[arg(long)]
    tgid: Vec<u32>,

    /// Only show processes whose name contains this string
    #[arg(long)]
    comm: Vec<String>,

    /// Hide processes whose name contains this string
    #[arg(long)]
    exclude_comm: Vec<String>,

    /// Interceptor variant (auto, kprobe, fentry)
    #[arg(long)]
    attach_mode: Option<AttachMode>,

    /// Do not snapshot command lines at exec time
    #[arg(long)]
    no_cmdline: bool,

    /// Do not fill missing command lines from /proc
    #[arg(long)]
    no_proc_fallback: bool,

    /// Path to the probe object (defaults to the embedded one)
    #[arg(long)]
    ebpf_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every DNS send as it happens (requires root)
    Snoop {
        #[command(flatten)]
        capture: CaptureArgs,

        /// Comma separated columns (TIME,PID,TGID,PNAME,PORT,HOOK,HOST,CMDLINE)
        #[arg(long)]
        fields: Option<String>,

        /// Output format (text, json)
        #[arg(short, long)]
        format: Option<OutputFormat>,

        /// Also append records to this JSONL file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the processes sending the most DNS traffic (requires root)
    Top {
        #[command(flatten)]
        capture: CaptureArgs,

        /// Refresh period in seconds
        #[arg(short, long)]
        period: Option<u64>,

        /// Rows to display
        #[arg(short = 'n', long, default_value = "20")]
        rows: usize,

        /// Merge processes sharing a name
        #[arg(long)]
        by_comm: bool,

        /// Only show processes that sent during the last period
        #[arg(long)]
        active: bool,
    },

    /// Serve per-process DNS send counters for Prometheus (requires root)
    Exporter {
        #[command(flatten)]
        capture: CaptureArgs,

        /// Listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Run against a simulated workload (no eBPF required)
    Demo {
        /// Interval between workload rounds in milliseconds
        #[arg(long, default_value = "1000")]
        interval: u64,

        /// Number of records to print (0 = infinite)
        #[arg(long, default_value = "0")]
        count: u64,

        /// Comma separated columns
        #[arg(long)]
        fields: Option<String>,

        /// Output format (text, json)
        #[arg(short, long)]
        format: Option<OutputFormat>,

        /// Do not snapshot command lines at exec time
        #[arg(long)]
        no_cmdline: bool,
    },

    /// Show capabilities and the interceptor that would be used
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.clone());

    // -v takes precedence over the config log level
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.general.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    // Records go to stdout, logs to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Snoop {
            capture,
            fields,
            format,
            output,
        } => {
            merge_capture_args(&mut config.capture, capture);
            if let Some(fields) = fields {
                config.output.fields = fields;
            }
            if let Some(format) = format {
                config.output.format = format;
            }
            if let Some(output) = output {
                config.output.jsonl_path = Some(output.to_string_lossy().into_owned());
            }
            let backend = EbpfCapture::with_config(EbpfCaptureConfig::from_settings(&config.capture));
            snoop_command(&config, Box::new(backend)).await
        }
        Commands::Top {
            capture,
            period,
            rows,
            by_comm,
            active,
        } => {
            merge_capture_args(&mut config.capture, capture);
            if let Some(period) = period {
                config.output.period_secs = period.max(1);
            }
            let backend = EbpfCapture::with_config(EbpfCaptureConfig::from_settings(&config.capture));
            top_command(
                &config,
                Box::new(backend),
                TopOptions {
                    rows,
                    by_comm,
                    active,
                },
            )
            .await
        }
        Commands::Exporter { capture, listen } => {
            merge_capture_args(&mut config.capture, capture);
            let listen = match listen {
                Some(addr) => addr,
                None => config.exporter.listen.parse()?,
            };
            let backend = EbpfCapture::with_config(EbpfCaptureConfig::from_settings(&config.capture));
            exporter_command(&config, Box::new(backend), listen).await
        }
        Commands::Demo {
            interval,
            count,
            fields,
            format,
            no_cmdline,
        } => {
            if let Some(fields) = fields {
                config.output.fields = fields;
            }
            if let Some(format) = format {
                config.output.format = format;
            }
            let backend = SyntheticCapture::with_config(SyntheticConfig {
                interval_ms: interval.max(1),
                event_count: count,
                cmdline_enrichment: config.capture.cmdline_enrichment && !no_cmdline,
                filter: EventFilter::from_settings(&config.capture),
                ..Default::default()
            });
            println!();
            println!("  dnswatch v{} - DEMO MODE", env!("CARGO_PKG_VERSION"));
            println!("  Simulated workload every {}ms", interval);
            println!();
            snoop_command(&config, Box::new(backend)).await
        }
        Commands::Status => status_command(&config).await,
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> DnswatchConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            eprintln!("dnswatch: failed to load configuration: {}, using defaults", e);
            DnswatchConfig::default()
        }
    }
}

/// Apply capture flags on top of the config file settings.
///
/// Filter lists given on the command line replace the configured ones;
/// the `--no-*` switches can only turn features off.
fn merge_capture_args(settings: &mut CaptureSettings, args: CaptureArgs) {
    if !args.pid.is_empty() {
        settings.pid_filter = args.pid;
    }
    if !args.tgid.is_empty() {
        settings.tgid_filter = args.tgid;
    }
    if !args.comm.is_empty() {
        settings.process_filter = args.comm;
    }
    if !args.exclude_comm.is_empty() {
        settings.exclude_process = args.exclude_comm;
    }
    if let Some(mode) = args.attach_mode {
        settings.attach_mode = mode;
    }
    if args.no_cmdline {
        settings.cmdline_enrichment = false;
    }
    if args.no_proc_fallback {
        settings.proc_fallback = false;
    }
    if let Some(path) = args.ebpf_path {
        settings.ebpf_path = Some(path.to_string_lossy().into_owned());
    }
}

/// Sinks for `snoop` and `demo`
fn build_sinks(config: &DnswatchConfig) -> anyhow::Result<Vec<Box<dyn RecordSink>>> {
    let mut sinks: Vec<Box<dyn RecordSink>> = Vec::new();

    match config.output.format {
        OutputFormat::Text => {
            let printer = TextPrinter::stdout(parse_fields(&config.output.fields)?);
            printer.print_header()?;
            sinks.push(Box::new(printer));
        }
        OutputFormat::Json => {
            sinks.push(Box::new(JsonlExporter::open(JsonlExporterConfig::default())?));
        }
    }

    if let Some(path) = &config.output.jsonl_path {
        sinks.push(Box::new(JsonlExporter::open(JsonlExporterConfig {
            path: Some(PathBuf::from(path)),
            append: true,
            flush_each: true,
        })?));
    }

    Ok(sinks)
}

async fn snoop_command(
    config: &DnswatchConfig,
    mut backend: Box<dyn CaptureBackend>,
) -> anyhow::Result<()> {
    let sinks = build_sinks(config)?;

    let (tx, mut rx) = mpsc::channel(config.capture.channel_capacity);
    backend.start(tx).await?;
    info!("{} capture started, press Ctrl+C to stop", backend.name());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            record = rx.recv() => {
                let Some(record) = record else { break };
                export_record(&sinks, &record).await;
            }
            _ = &mut shutdown => break,
        }
    }

    backend.stop().await?;
    for sink in &sinks {
        if let Err(e) = sink.flush().await {
            warn!("Failed to flush {} output: {}", sink.name(), e);
        }
    }

    let stats = backend.stats();
    info!(
        "Capture stopped: {} records, {} dropped, {} errors",
        stats.events_captured, stats.events_dropped, stats.errors
    );
    Ok(())
}

async fn export_record(sinks: &[Box<dyn RecordSink>], record: &DnsSendRecord) {
    debug!("{}", call_line(record));
    for sink in sinks {
        if let Err(e) = sink.export(record).await {
            error!("{} output failed: {}", sink.name(), e);
        }
    }
}

struct TopOptions {
    rows: usize,
    by_comm: bool,
    active: bool,
}

async fn top_command(
    config: &DnswatchConfig,
    mut backend: Box<dyn CaptureBackend>,
    options: TopOptions,
) -> anyhow::Result<()> {
    let period = Duration::from_secs(config.output.period_secs);
    let mut aggregator = TopAggregator::new();

    let (tx, mut rx) = mpsc::channel(config.capture.channel_capacity);
    backend.start(tx).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut refresh = tokio::time::interval(period);

    loop {
        tokio::select! {
            record = rx.recv() => {
                let Some(record) = record else { break };
                debug!("{}", call_line(&record));
                aggregator.record(&record);
            }
            _ = refresh.tick() => {
                let since = options
                    .active
                    .then(|| chrono::Utc::now() - chrono::Duration::seconds(period.as_secs() as i64));
                // Clear the screen and home the cursor
                print!("\x1B[2J\x1B[H");
                print!("{}", aggregator.render(options.rows, options.by_comm, since));
            }
            _ = &mut shutdown => break,
        }
    }

    backend.stop().await?;
    Ok(())
}

async fn exporter_command(
    config: &DnswatchConfig,
    mut backend: Box<dyn CaptureBackend>,
    listen: SocketAddr,
) -> anyhow::Result<()> {
    let metrics = Arc::new(MetricsCollector::new());

    let (tx, mut rx) = mpsc::channel(config.capture.channel_capacity);
    backend.start(tx).await?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve_metrics(listen, metrics.clone(), async move {
        let _ = stop_rx.await;
    }));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut stats_tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            record = rx.recv() => {
                let Some(record) = record else { break };
                metrics.record(&record);
            }
            _ = stats_tick.tick() => metrics.update_capture(backend.stats()),
            _ = &mut shutdown => break,
        }
    }

    backend.stop().await?;
    let _ = stop_tx.send(());
    server.await??;
    info!("Exporter stopped after {} DNS sends", metrics.total_sends());
    Ok(())
}

async fn status_command(config: &DnswatchConfig) -> anyhow::Result<()> {
    println!();
    println!("dnswatch v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    println!();
    println!("Capabilities:");
    println!("  Running as root: {}", is_root());
    println!("  eBPF supported: {}", check_ebpf_available());
    println!("  BTF available: {}", has_btf());
    match get_kernel_version() {
        Some((major, minor, patch)) => println!("  Kernel: {}.{}.{}", major, minor, patch),
        None => println!("  Kernel: unknown"),
    }

    let interceptor = resolve_interceptor(config.capture.attach_mode);
    println!();
    println!("Interceptors (attach mode: {}):", config.capture.attach_mode);
    for fn_id in FnId::ALL {
        println!("  {:<15} {}", fn_id.symbol(), interceptor.program_name(fn_id));
    }
    println!(
        "  Command lines: {}",
        if config.capture.cmdline_enrichment {
            "exec-time snapshot"
        } else {
            "disabled"
        }
    );
    println!();
    Ok(())
}
