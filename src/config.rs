use crate::bench::RateLimit;
use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 32850;

/// Sender byte cap, bounding unattended runs.
pub const DEFAULT_TOTAL_BYTES: u64 = 10 << 30;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub listen: SocketAddr,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub total_bytes: u64,
    pub trace_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// `host:port` of the sender.
    pub remote: String,
    pub insecure: bool,
    pub duration: Option<Duration>,
    pub rate_limit: RateLimit,
    pub trace_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum Role {
    Sender(SenderConfig),
    Receiver(ReceiverConfig),
}

pub fn command() -> Command {
    Command::new("qperf")
        .about("Measure bulk QUIC transfer throughput")
        .arg(
            Arg::new("serve")
                .short('s')
                .action(ArgAction::SetTrue)
                .help("Run as a server, sending data to every client that connects"),
        )
        .arg(
            Arg::new("client")
                .short('c')
                .default_value("localhost:32850")
                .help("Run as a client to the specified remote"),
        )
        .arg(
            Arg::new("addr")
                .long("addr")
                .default_value(":32850")
                .help("Listen on this address"),
        )
        .arg(
            Arg::new("cert")
                .long("cert")
                .value_parser(value_parser!(PathBuf))
                .help("Path to the TLS certificate file"),
        )
        .arg(
            Arg::new("key")
                .long("key")
                .value_parser(value_parser!(PathBuf))
                .help("Path to the TLS private key file"),
        )
        .arg(
            Arg::new("insecure")
                .long("insecure")
                .action(ArgAction::SetTrue)
                .help("Don't verify TLS certificate details"),
        )
        .arg(
            Arg::new("seconds")
                .long("seconds")
                .value_parser(value_parser!(u64).range(1..))
                .help("Run the test for this number of seconds"),
        )
        .arg(
            Arg::new("bandwidth")
                .short('b')
                .help("Limit download bitrate to this many bits/sec; a K, M, G or T suffix is allowed, e.g. 1G"),
        )
        .arg(
            Arg::new("total-bytes")
                .long("total-bytes")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("10737418240")
                .help("Stop sending to a client after this many bytes"),
        )
        .arg(
            Arg::new("qlog-dest-dir")
                .long("qlog-dest-dir")
                .value_parser(value_parser!(PathBuf))
                .help("Write one JSON-lines event trace (<role>_<id>.jsonl) per connection into this directory"),
        )
}

/// Accepts `host:port` socket addresses and the `:port` shorthand for all
/// IPv4 interfaces.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    };
    full.parse()
        .with_context(|| format!("invalid listen address {:?}", addr))
}

impl Role {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let trace_dir = matches.get_one::<PathBuf>("qlog-dest-dir").cloned();

        if matches.get_flag("serve") {
            let addr = matches
                .get_one::<String>("addr")
                .ok_or_else(|| anyhow!("missing listen address"))?;
            let cert = matches
                .get_one::<PathBuf>("cert")
                .ok_or_else(|| anyhow!("--cert is required when running as a server"))?;
            let key = matches
                .get_one::<PathBuf>("key")
                .ok_or_else(|| anyhow!("--key is required when running as a server"))?;
            let total_bytes = matches
                .get_one::<u64>("total-bytes")
                .copied()
                .unwrap_or(DEFAULT_TOTAL_BYTES);
            return Ok(Role::Sender(SenderConfig {
                listen: parse_listen_addr(addr)?,
                cert: cert.clone(),
                key: key.clone(),
                total_bytes,
                trace_dir,
            }));
        }

        let remote = matches
            .get_one::<String>("client")
            .ok_or_else(|| anyhow!("missing remote address"))?;
        let bandwidth = matches
            .get_one::<String>("bandwidth")
            .map(String::as_str)
            .unwrap_or("");
        let rate_limit = RateLimit::parse(bandwidth).context("invalid -b option")?;
        Ok(Role::Receiver(ReceiverConfig {
            remote: remote.clone(),
            insecure: matches.get_flag("insecure"),
            duration: matches.get_one::<u64>("seconds").map(|s| Duration::from_secs(*s)),
            rate_limit,
            trace_dir,
        }))
    }
}
