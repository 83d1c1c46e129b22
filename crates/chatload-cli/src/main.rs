// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod format;

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chatload_pipeline::options::DEFAULT_PORT;
use chatload_pipeline::reader::{self, LogFile};
use chatload_pipeline::{pipeline, Host, Options, RunSummary};

use crate::format::{format_duration, format_size};

/// Scrapes chat logs for character activity and uploads per-channel reports
/// to a configurable set of collector endpoints.
#[derive(Parser, Debug)]
#[command(name = "chatload", version, about)]
struct Cli {
    /// Directory containing the chat logs [default: Documents/EVE/logs/Chatlogs]
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Filename mtime cache [default: <cache dir>/chatload/filecache.tsv]
    #[arg(long, value_name = "FILE")]
    cache_file: Option<PathBuf>,

    /// Read all logs, even ones the cache marks as unchanged
    #[arg(long)]
    no_cache: bool,

    /// Only read log files whose name matches this pattern
    #[arg(short, long, default_value = ".*", value_name = "PATTERN")]
    regex: String,

    /// Report every file as it is read
    #[arg(short, long)]
    verbose: bool,

    /// Collector endpoint as NAME[:PORT]; repeatable
    #[arg(long = "host", value_name = "NAME[:PORT]")]
    hosts: Vec<String>,

    /// Disable TLS certificate verification for all hosts
    #[arg(long)]
    insecure: bool,

    /// Disable TLS certificate verification for the named host only; repeatable
    #[arg(long, value_name = "NAME")]
    insecure_host: Vec<String>,

    /// Additional PEM trust anchors
    #[arg(long, value_name = "FILE")]
    ca_file: Option<PathBuf>,

    /// Directory of additional PEM trust anchors
    #[arg(long, value_name = "DIR")]
    ca_path: Option<PathBuf>,

    /// Restrict TLSv1.2 cipher suites (rustls names, `:`/`,` separated)
    #[arg(long, value_name = "LIST")]
    cipher_list: Option<String>,

    /// Restrict TLSv1.3 cipher suites (rustls names, `:`/`,` separated)
    #[arg(long, value_name = "LIST")]
    ciphersuites: Option<String>,

    /// Upload timeout in seconds
    #[arg(long, default_value_t = 30, value_name = "SECONDS")]
    timeout: u64,

    /// Upload reports uncompressed
    #[arg(long)]
    no_compress: bool,
}

fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let level = env::var("CHATLOAD_LOG").unwrap_or_else(|_| "warn".to_owned());
    let filter = format!("rustls=off,{level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).expect("could not parse log level"))
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Returns whether the run succeeded end to end (reader and every host).
fn run(cli: Cli) -> Result<bool> {
    println!(
        "This app scrapes your chat logs for character activity and \
         uploads per-channel reports to a configurable set of remote databases\n"
    );

    let verbose = cli.verbose;
    let options = build_options(cli)?;

    let (queue_tx, queue_rx) = pipeline::file_queue();

    // Consumer: parse, deduplicate, compress, upload.
    let consumer_options = options.clone();
    let consumer = thread::spawn(move || -> Result<RunSummary> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        runtime
            .block_on(pipeline::run(&consumer_options, queue_rx))
            .map_err(Into::into)
    });

    // Reader runs on this thread.
    let mut reader_failed = false;
    let mut progress: Box<dyn FnMut(&LogFile)> = if verbose {
        println!("Files read:");
        Box::new(|file: &LogFile| {
            let plural = if file.size == 1 { "" } else { "s" };
            println!("{} ({} byte{plural})", file.name, file.size);
        })
    } else {
        println!("Reading files...");
        Box::new(|_: &LogFile| {})
    };
    match reader::read_logs(&options, &queue_tx, Some(progress.as_mut())) {
        Ok(stats) => {
            println!(
                "Total of {} files with a size of {} processed within {}",
                stats.files_read,
                format_size(stats.bytes_read),
                format_duration(stats.duration)
            );
        }
        Err(err) => {
            eprintln!("ERROR: {err}");
            reader_failed = true;
        }
    }
    drop(queue_tx);

    println!("\nWaiting for uploads to finish...");
    let summary = consumer
        .join()
        .map_err(|_| anyhow!("upload thread panicked"))??;

    Ok(report_summary(&summary) && !reader_failed)
}

/// Print per-host outcomes and the upload summary; returns whether every
/// host succeeded.
fn report_summary(summary: &RunSummary) -> bool {
    for report in &summary.hosts {
        if let Some(error) = &report.error {
            eprintln!("ERROR ({}): {error}", report.host);
        }
    }

    let failed = summary.failed_hosts();
    let total = summary.hosts.len();
    if failed < total {
        println!(
            "Uploaded {} character reports ({}) successfully to {} remote host{} within {}",
            summary.reports,
            format_size(summary.compressed_bytes),
            total - failed,
            if total - failed == 1 { "" } else { "s" },
            format_duration(summary.duration)
        );
    } else {
        println!(
            "All {total} uploads failed within {}",
            format_duration(summary.duration)
        );
    }

    failed == 0
}

fn build_options(cli: Cli) -> Result<Options> {
    let log_dir = match cli.log_dir {
        Some(dir) => dir,
        None => dirs::document_dir()
            .ok_or_else(|| anyhow!("could not determine the documents folder; use --log-dir"))?
            .join("EVE")
            .join("logs")
            .join("Chatlogs"),
    };

    let cache_path = match cli.cache_file {
        Some(path) => Some(path),
        None => dirs::cache_dir().map(|dir| dir.join("chatload").join("filecache.tsv")),
    };

    let filename_regex = regex::Regex::new(&cli.regex)
        .with_context(|| format!("invalid filename pattern {:?}", cli.regex))?;

    let mut hosts = if cli.hosts.is_empty() {
        vec![Host::default()]
    } else {
        cli.hosts
            .iter()
            .map(|spec| parse_host(spec))
            .collect::<Result<Vec<_>>>()?
    };
    for host in &mut hosts {
        host.insecure_tls = cli.insecure || cli.insecure_host.contains(&host.name);
    }

    Ok(Options {
        log_dir,
        cache_path,
        use_cache: !cli.no_cache,
        filename_regex,
        verbose: cli.verbose,
        hosts,
        ca_file: cli.ca_file,
        ca_path: cli.ca_path,
        cipher_list: cli.cipher_list,
        ciphersuites: cli.ciphersuites,
        timeout: Duration::from_secs(cli.timeout),
        compress: !cli.no_compress,
    })
}

/// Parse `NAME[:PORT]`. Host names never contain colons.
fn parse_host(spec: &str) -> Result<Host> {
    let (name, port) = match spec.rsplit_once(':') {
        Some((name, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in host {spec:?}"))?;
            (name, port)
        }
        None => (spec, DEFAULT_PORT),
    };
    if name.is_empty() {
        bail!("empty host name in {spec:?}");
    }
    Ok(Host::new(name, port))
}
