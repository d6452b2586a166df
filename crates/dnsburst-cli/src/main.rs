//! CLI for dnsburst — flood a DNS server and measure what comes back.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::exit;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use clap::Parser;

use dnsburst_core::{
    Event, InputSource, Mode, NetFactory, QueryBuilder, RunConfig, RunContext, RunSummary,
    coordinator, default_max_passes,
};

#[derive(Parser)]
#[command(name = "dnsburst")]
#[command(about = "dnsburst — flood a DNS server with queries and measure what comes back")]
#[command(version = dnsburst_core::VERSION)]
struct Cli {
    /// Server address to query
    #[arg(short = 's', default_value = "127.0.0.1")]
    server: String,

    /// Server port (default 53, or 853 with -m tls)
    #[arg(short = 'p')]
    port: Option<u16>,

    /// Datafile of "name [type]" lines; - reads stdin
    #[arg(short = 'd', default_value = "-")]
    datafile: String,

    /// Transport mode
    #[arg(short = 'm', default_value = "udp", value_parser = ["udp", "tcp", "tls"])]
    mode: String,

    /// Total client sockets
    #[arg(short = 'c', default_value = "1")]
    clients: usize,

    /// Worker thread count
    #[arg(short = 'T', default_value = "1")]
    threads: usize,

    /// Global max outstanding queries
    #[arg(short = 'q', default_value = "100")]
    max_outstanding: usize,

    /// Global max queries per second (0 = unlimited)
    #[arg(short = 'Q', default_value = "0")]
    max_qps: u64,

    /// Per-query timeout in seconds (fractional allowed)
    #[arg(short = 't', default_value = "5.0")]
    timeout: f64,

    /// Total time limit in seconds (0 = run until input is exhausted)
    #[arg(short = 'l', default_value = "0")]
    time_limit: f64,

    /// Max passes over the input (0 = unlimited; default 1, or 0 with -l)
    #[arg(short = 'n')]
    max_passes: Option<u64>,

    /// Interval-statistics period in seconds (0 = off)
    #[arg(short = 'S', default_value = "0")]
    stats_interval: f64,

    /// Attach an EDNS(0) OPT record to every query
    #[arg(short = 'e')]
    edns: bool,

    /// Set the DNSSEC OK bit (implies -e)
    #[arg(short = 'D')]
    dnssec: bool,

    /// Socket send/receive buffer size in kilobytes
    #[arg(short = 'b')]
    bufsize: Option<usize>,

    /// Local address to bind client sockets to
    #[arg(short = 'x')]
    local: Option<IpAddr>,

    /// Print one line per completed query
    #[arg(short = 'v')]
    verbose: bool,

    /// Verify TLS against this PEM CA bundle (default: no verification)
    #[arg(long = "tls-ca")]
    tls_ca: Option<PathBuf>,

    /// Per-worker latency sample cap
    #[arg(long = "max-samples", default_value_t = dnsburst_core::stats::DEFAULT_MAX_SAMPLES)]
    max_samples: usize,

    /// Also write the final summary as JSON to this file
    #[arg(long = "output")]
    output: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mode = match cli.mode.as_str() {
        "udp" => Mode::Udp,
        "tcp" => Mode::Tcp,
        "tls" => Mode::Tls,
        other => fatal(&format!("unknown mode '{other}'")),
    };
    let port = cli.port.unwrap_or(if mode == Mode::Tls { 853 } else { 53 });
    let server = resolve_server(&cli.server, port);

    for (flag, value) in [
        ("-t", cli.timeout),
        ("-l", cli.time_limit),
        ("-S", cli.stats_interval),
    ] {
        if !value.is_finite() || value < 0.0 {
            fatal(&format!("{flag} must be a non-negative number of seconds"));
        }
    }

    let time_limit = (cli.time_limit > 0.0).then(|| Duration::from_secs_f64(cli.time_limit));
    let config = RunConfig {
        clients: cli.clients,
        threads: cli.threads,
        max_outstanding: cli.max_outstanding,
        max_qps: cli.max_qps,
        timeout: Duration::from_secs_f64(cli.timeout),
        time_limit,
        max_passes: cli.max_passes.unwrap_or_else(|| default_max_passes(time_limit)),
        stats_interval: (cli.stats_interval > 0.0)
            .then(|| Duration::from_secs_f64(cli.stats_interval)),
        verbose: cli.verbose,
        builder: QueryBuilder {
            edns: cli.edns || cli.dnssec,
            dnssec_ok: cli.dnssec,
            udpsize: 4096,
        },
        max_samples: cli.max_samples,
    };

    let input = match InputSource::load(&cli.datafile, config.max_passes) {
        Ok(input) => Arc::new(input),
        Err(e) => fatal(&e.to_string()),
    };

    let tls = if mode == Mode::Tls {
        match dnsburst_core::client_config(cli.tls_ca.as_deref()) {
            Ok(cfg) => Some(cfg),
            Err(e) => fatal(&e.to_string()),
        }
    } else {
        None
    };
    let factory = NetFactory {
        mode,
        server,
        server_name: cli.server.clone(),
        local: cli.local,
        bufsize_kb: cli.bufsize,
        tls,
    };

    let ctx = match RunContext::new(config.time_limit) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => fatal(&format!("cannot set up run context: {e}")),
    };
    let (events_tx, events_rx) = mpsc::channel();

    // The handler's only job is to wake the coordinator.
    {
        let ctx = Arc::clone(&ctx);
        let tx = events_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            ctx.interrupt();
            let _ = tx.send(Event::Interrupted);
        }) {
            fatal(&format!("cannot install signal handler: {e}"));
        }
    }

    let args: Vec<String> = std::env::args().collect();
    println!("[Status] Command line: {}", args.join(" "));
    println!(
        "[Status] Sending queries (to {server}, {mode}, {} entries in datafile)",
        input.len()
    );
    if let Some(limit) = config.time_limit {
        println!("[Status] Stopping after {:.6} seconds", limit.as_secs_f64());
    }

    let result = match coordinator::run(&config, input, &factory, ctx, events_tx, events_rx) {
        Ok(result) => result,
        Err(e) => fatal(&e.to_string()),
    };

    println!("[Status] Testing complete ({})", result.reason);
    result.summary.print();
    RunSummary::print_samples(&result.reports);

    if let Some(path) = &cli.output {
        match serde_json::to_string_pretty(&result.summary) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    eprintln!("Error writing report to {}: {e}", path.display());
                    exit(1);
                }
            }
            Err(e) => {
                eprintln!("Error serializing report: {e}");
                exit(1);
            }
        }
    }
}

/// `-s` accepts a literal address or a hostname to resolve.
fn resolve_server(server: &str, port: u16) -> SocketAddr {
    if let Ok(ip) = server.parse::<IpAddr>() {
        return SocketAddr::new(ip, port);
    }
    match (server, port).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => fatal(&format!("'{server}' resolved to no addresses")),
        },
        Err(e) => fatal(&format!("cannot resolve '{server}': {e}")),
    }
}

fn fatal(msg: &str) -> ! {
    eprintln!("Error: {msg}");
    exit(1);
}
