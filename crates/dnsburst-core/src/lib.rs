//! # dnsburst-core
//!
//! The engine behind `dnsburst`: a multi-threaded DNS load generator.
//!
//! Each worker owns a bank of client sockets and runs two threads over a
//! shared query table — a sender that paces queries under concurrency and
//! QPS ceilings, and a receiver that correlates replies by transaction id,
//! expires the silent ones, and accumulates latency statistics off the hot
//! path. A coordinator splits global limits across workers, releases them
//! through a start barrier, and tears everything down on deadline, input
//! exhaustion, or interrupt.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::{Arc, mpsc};
//! use dnsburst_core::{
//!     InputSource, Mode, NetFactory, RunConfig, RunContext, coordinator,
//! };
//!
//! let config = RunConfig::default();
//! let input = Arc::new(InputSource::load("queries.txt", config.max_passes).unwrap());
//! let factory = NetFactory {
//!     mode: Mode::Udp,
//!     server: "127.0.0.1:53".parse().unwrap(),
//!     server_name: "127.0.0.1".to_string(),
//!     local: None,
//!     bufsize_kb: None,
//!     tls: None,
//! };
//! let ctx = Arc::new(RunContext::new(config.time_limit).unwrap());
//! let (tx, rx) = mpsc::channel();
//! let result = coordinator::run(&config, input, &factory, ctx, tx, rx).unwrap();
//! result.summary.print();
//! ```

pub mod bank;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod input;
mod receiver;
pub mod run;
mod sender;
pub mod stats;
pub mod table;
pub mod transport;
pub mod wire;
pub mod worker;

pub use config::{RunConfig, WorkerConfig, default_max_passes};
pub use coordinator::{RunResult, run};
pub use error::Error;
pub use input::{InputSource, QueryDescriptor};
pub use run::{Event, RunContext, StopReason};
pub use stats::{RunSummary, WorkerReport, format_us};
pub use transport::{
    Mode, NetFactory, Probe, Transport, TransportFactory, client_config,
};
pub use wire::{QueryBuilder, rcode_name};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
