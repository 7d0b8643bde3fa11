//! Repeated consensus sessions under injected faults.
//!
//! Runs the quickstart session against a fresh cluster, over and over,
//! and exits non-zero with a diagnostic the moment a session breaks
//! consensus.

use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use kevlar::faults::FaultInjector;
use kevlar::session::{SessionConfig, cluster, run_session};

#[derive(Parser, Debug)]
#[command(name = "kevlar")]
#[command(about = "Exercise the replicated register under injected faults")]
struct Args {
    /// Number of keepers in the cluster
    #[arg(short, long, default_value_t = 5)]
    keepers: usize,

    /// Number of sessions to run
    #[arg(short, long, default_value_t = 100)]
    sessions: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    if args.keepers < 2 {
        eprintln!("a cluster needs at least 2 keepers");
        return ExitCode::FAILURE;
    }

    let config = SessionConfig::quickstart();
    for session in 1..=args.sessions {
        // Fresh keepers per session: the register only lives for the
        // lifetime of one session.
        let faults = Arc::new(FaultInjector::new(config.faults.clone()));
        let coordinators = cluster(args.keepers, &faults);

        if let Err(report) = run_session(&config, &coordinators, &faults).await {
            eprintln!("\nsession {session}/{}: {report:?}", args.sessions);
            return ExitCode::FAILURE;
        }

        print!("\rsession {session}/{} passed", args.sessions);
        let _ = std::io::stdout().flush();
    }

    println!("\nconsensus maintained");
    ExitCode::SUCCESS
}
