//! OCC daemon
//!
//! Loads `occ.yaml`, connects to pubsub and runs on-commit commands.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use occ::{
    Config, Dispatcher, EventSource, LineSource, MailNotifier, OccResult, Payload, PubSubListener, Sendmail,
    SystemExecutor,
};

#[derive(Parser, Debug)]
#[command(name = "occ", version)]
#[command(about = "Run local commands in response to pubsub commit notifications")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "occ.yaml")]
    config: PathBuf,

    /// Read newline-delimited JSON payloads from stdin instead of pubsub
    #[arg(long, default_value_t = false)]
    stdin: bool,
}

fn run(args: &Args) -> OccResult<()> {
    tracing::info!(path = %args.config.display(), "loading configuration");
    let config = Arc::new(Config::load(&args.config)?);
    tracing::info!(subscriptions = config.subscriptions.len(), "configuration loaded");

    let notifier = MailNotifier::new(Sendmail::from_config(&config.mail));
    let executor = SystemExecutor::new();
    let dispatcher = Dispatcher::new(Arc::clone(&config), executor, notifier);
    let mut handler = |payload: Payload| {
        let report = dispatcher.handle(&payload);
        if !report.rules.is_empty() {
            tracing::info!(
                fired = ?report.fired(),
                failures = report.failures(),
                stopped_by = report.stopped_by.as_deref().unwrap_or(""),
                "event dispatched"
            );
        }
    };

    if args.stdin {
        let stdin = std::io::stdin();
        LineSource::new(stdin.lock()).run(&mut handler)
    } else {
        PubSubListener::new(config.pubsub.clone())?.run(&mut handler)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "occ stopped");
            ExitCode::FAILURE
        }
    }
}
