// ============================================================================
// File: packages/ovbackup/src/main.rs
// ----------------------------------------------------------------------------
// ovbackup binary: parse arguments, load the rc file, run one backup.
//
// Exit status: 0 on success or when the VM is not running, 1 on failure,
// 2 on usage errors (reported by clap), 130 when a second signal cut
// cleanup short.
// ============================================================================

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use ovbackup::cli::{self, Args};
use ovbackup::config::ShellConfig;
use ovbackup::logging;
use ovbackup::orchestrator::BackupOrchestrator;
use ovbackup::platform::OvirtApiClient;

/// Exit status after an interrupt that skipped cleanup (128 + SIGINT)
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(&args.log_file);

    match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}: {e:#}", args.vmname);
            println!("{}: backup failed [config]: {e:#}", args.vmname);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> anyhow::Result<ExitCode> {
    let config = ShellConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    let request = args.request();

    let client = OvirtApiClient::new(config.session(), config.settings.request_timeout)
        .context("setting up the engine client")?;
    let orchestrator = BackupOrchestrator::new(client, config.settings.clone());

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));
    let outcome = orchestrator.run(&request, &cancel).await;
    signals.abort();

    let stats = orchestrator.client().stats();
    info!(
        "{}: {} API calls, {} failed",
        request.vm_name,
        stats.api_calls(),
        stats.failed_calls()
    );

    println!("{}", cli::status_line(&request.vm_name, &outcome));
    Ok(ExitCode::from(cli::exit_code(&outcome)))
}

/// Cancel the run on SIGINT or SIGTERM; a second signal exits at once
async fn cancel_on_signal(cancel: CancellationToken) {
    next_signal().await;
    warn!("Signal received, cancelling backup (signal again to exit without cleanup)");
    cancel.cancel();

    next_signal().await;
    error!("Second signal received, exiting without cleanup");
    std::process::exit(EXIT_INTERRUPTED);
}

async fn next_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
