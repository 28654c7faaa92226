use clap::{Parser, ValueEnum};
use eyre::eyre;
use std::path::PathBuf;
use std::time::Duration;

use delivery_oracle::controller::locate_binary;
use delivery_oracle::{
    ControllerConfig, Endpoint, Framing, HeaderFormat, MalformedLinePolicy, ScanOptions, SinkDescriptor,
    TlsOptions, TransportConfig,
};

type Result<T> = color_eyre::eyre::Result<T>;

/// Transport used to push messages into the subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    Tcp,
    Tls,
    Udp,
    UnixStream,
    UnixDgram,
    /// Regular file or FIFO
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FramingArg {
    None,
    OctetCounting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Strict,
    TolerateTrailing,
    SkipMalformed,
}

/// Drives a log-processing daemon and checks message delivery
#[derive(Parser)]
#[command(name = "delivery-oracle")]
#[command(about = "Drives a log-processing daemon and checks that every message arrives exactly once, in order")]
#[command(version)]
pub struct Cli {
    /// Subject executable (default: $SUBJECT_BINARY, then syslog-ng)
    #[arg(long)]
    pub subject: Option<PathBuf>,

    /// Subject configuration file
    #[arg(long)]
    pub config: PathBuf,

    /// Working directory of the subject
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,

    /// Module search path passed to the subject
    #[arg(long)]
    pub module_path: Option<String>,

    /// Run the subject with debug and verbose output
    #[arg(long)]
    pub verbose_subject: bool,

    /// Keep the subject's persist file from a previous run
    #[arg(long)]
    pub keep_persist: bool,

    /// Wait after starting the subject (ms)
    #[arg(long, default_value = "5000")]
    pub start_settle_ms: u64,

    /// Wait after sending the reload signal (ms)
    #[arg(long, default_value = "2000")]
    pub reload_settle_ms: u64,

    /// Transport kind
    #[arg(long, value_enum, default_value = "tcp")]
    pub transport: TransportKind,

    /// host:port for IP transports, path otherwise
    #[arg(long)]
    pub target: String,

    /// Server name for TLS
    #[arg(long, default_value = "localhost")]
    pub tls_server_name: String,

    /// CA bundle for TLS; without it any certificate is accepted
    #[arg(long)]
    pub tls_ca: Option<PathBuf>,

    /// Pad FIFO records with NUL bytes to this size
    #[arg(long)]
    pub record_width: Option<usize>,

    /// Write messages one byte at a time
    #[arg(long)]
    pub send_by_bytes: bool,

    /// Use the structured header format
    #[arg(long)]
    pub structured: bool,

    /// Override the framing chosen from the header format
    #[arg(long, value_enum)]
    pub framing: Option<FramingArg>,

    /// Message terminator; \n, \r and \0 escapes are understood
    #[arg(long, default_value = "\\n")]
    pub terminator: String,

    /// Comma-separated message kinds, one stream each
    #[arg(long, value_delimiter = ',', required = true)]
    pub kinds: Vec<String>,

    /// Messages per stream
    #[arg(long, default_value = "100")]
    pub repeat: u32,

    /// Message priority
    #[arg(long, default_value = "7")]
    pub priority: u8,

    /// Output file(s) to check, relative to the working directory
    #[arg(long)]
    pub sink_file: Vec<PathBuf>,

    /// External command whose output is checked (whitespace separated)
    #[arg(long)]
    pub sink_command: Option<String>,

    /// SQLite database to check
    #[arg(long, requires = "sqlite_table")]
    pub sqlite_db: Option<PathBuf>,

    /// SQLite table to check
    #[arg(long, requires = "sqlite_db")]
    pub sqlite_table: Option<String>,

    /// Column the SQLite rows are ordered by
    #[arg(long, default_value = "msg")]
    pub sqlite_order_by: String,

    /// Extra file removed before the subject starts, e.g. a store read by --sink-command
    #[arg(long)]
    pub stale_artifact: Vec<PathBuf>,

    /// Wait before the flush signal (ms)
    #[arg(long, default_value = "1000")]
    pub settle_ms: u64,

    /// Prefix expected on sink lines (default: the header prefix)
    #[arg(long)]
    pub expect_prefix: Option<String>,

    /// Leading bytes ignored on every sink line
    #[arg(long, default_value = "0")]
    pub skip_prefix: usize,

    /// Handling of malformed sink lines
    #[arg(long, value_enum, default_value = "strict")]
    pub malformed: PolicyArg,

    /// Stop the subject before checking the sinks
    #[arg(long)]
    pub check_after_stop: bool,
}

/// Validated scenario configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub config_file: PathBuf,
    pub controller: ControllerConfig,
    pub transport: TransportConfig,
    pub kinds: Vec<String>,
    pub priority: u8,
    pub sinks: Vec<SinkDescriptor>,
    pub settle_time: Duration,
    pub scan: ScanOptions,
    pub check_after_stop: bool,
}

fn unescape(text: &str) -> String {
    text.replace("\\n", "\n").replace("\\r", "\r").replace("\\0", "\0")
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if let Some(kind) = cli.kinds.iter().find(|k| k.is_empty() || k.contains(char::is_whitespace)) {
            return Err(eyre!("Invalid message kind '{}'", kind));
        }
        if cli.repeat == 0 {
            return Err(eyre!("--repeat must be at least 1"));
        }

        let endpoint = match cli.transport {
            TransportKind::Tcp => Endpoint::tcp(cli.target),
            TransportKind::Udp => Endpoint::udp(cli.target),
            TransportKind::Tls => Endpoint::tls(
                cli.target,
                TlsOptions {
                    server_name: cli.tls_server_name,
                    ca_file: cli.tls_ca,
                },
            ),
            TransportKind::UnixStream => Endpoint::Unix {
                path: PathBuf::from(cli.target),
                dgram: false,
            },
            TransportKind::UnixDgram => Endpoint::Unix {
                path: PathBuf::from(cli.target),
                dgram: true,
            },
            TransportKind::File => Endpoint::File {
                path: PathBuf::from(cli.target),
                record_width: cli.record_width,
            },
        };
        if cli.record_width.is_some() && cli.transport != TransportKind::File {
            return Err(eyre!("--record-width only applies to the file transport"));
        }

        let header = if cli.structured {
            HeaderFormat::Structured
        } else {
            HeaderFormat::Legacy
        };
        let transport = TransportConfig {
            repeat: cli.repeat,
            header,
            framing: cli.framing.map(|framing| match framing {
                FramingArg::None => Framing::None,
                FramingArg::OctetCounting => Framing::OctetCounting,
            }),
            terminator: unescape(&cli.terminator),
            send_by_bytes: cli.send_by_bytes,
            ..TransportConfig::new(endpoint)
        };

        // Every output the subject writes must start empty
        let stale_artifacts: Vec<PathBuf> = cli
            .sink_file
            .iter()
            .chain(cli.sqlite_db.iter())
            .chain(cli.stale_artifact.iter())
            .cloned()
            .collect();

        let mut sinks: Vec<SinkDescriptor> = cli
            .sink_file
            .iter()
            .map(|path| SinkDescriptor::File(cli.workdir.join(path)))
            .collect();
        if let Some(command) = cli.sink_command {
            let mut parts = command.split_whitespace().map(str::to_string);
            let program = parts.next().ok_or_else(|| eyre!("--sink-command is empty"))?;
            sinks.push(SinkDescriptor::Command {
                program,
                args: parts.collect(),
                working_dir: Some(cli.workdir.clone()),
            });
        }
        if let (Some(database), Some(table)) = (cli.sqlite_db, cli.sqlite_table) {
            sinks.push(SinkDescriptor::Sqlite {
                database: cli.workdir.join(database),
                table,
                order_by: cli.sqlite_order_by,
            });
        }
        if sinks.is_empty() {
            return Err(eyre!("At least one sink (--sink-file, --sink-command or --sqlite-db) is required"));
        }

        let controller = ControllerConfig {
            binary: cli.subject.unwrap_or_else(locate_binary),
            working_directory: cli.workdir.clone(),
            module_path: cli.module_path,
            verbose: cli.verbose_subject,
            keep_persist: cli.keep_persist,
            start_settle: Duration::from_millis(cli.start_settle_ms),
            reload_settle: Duration::from_millis(cli.reload_settle_ms),
            stale_artifacts,
            ..Default::default()
        };

        let scan = ScanOptions {
            prefix: cli
                .expect_prefix
                .unwrap_or_else(|| header.prefix(&transport.fields)),
            skip_prefix: cli.skip_prefix,
            policy: match cli.malformed {
                PolicyArg::Strict => MalformedLinePolicy::Strict,
                PolicyArg::TolerateTrailing => MalformedLinePolicy::TolerateTrailing,
                PolicyArg::SkipMalformed => MalformedLinePolicy::SkipMalformed,
            },
        };

        Ok(Config {
            config_file: cli.config,
            controller,
            transport,
            kinds: cli.kinds,
            priority: cli.priority,
            sinks,
            settle_time: Duration::from_millis(cli.settle_ms),
            scan,
            check_after_stop: cli.check_after_stop,
        })
    }
}
