//! polex controller.
//!
//! Replays watch events from stdin into the report controller, backed by an
//! in-memory draft store. When stdin closes the controller drains its queue,
//! stops, and prints the resulting drafts to stdout as JSON lines.

mod logging;
mod replay;

use std::sync::Arc;

use polex_reconciler::{
    FailureTracker, MemoryDraftStore, PolicyConfigCache, Reconciler, ReconcilerConfig,
    ReportController,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::logging::{init_logging, LogFormat, DEFAULT_FILTER};

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    init_logging(DEFAULT_FILTER, LogFormat::from_env());

    let config = ReconcilerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    });

    info!(
        accepted_mode = %config.accepted_mode,
        categories = ?config.target_categories,
        workloads = ?config.target_workloads,
        excluded = ?config.exclude_namespaces,
        destination = ?config.destination_namespace,
        "Starting polex controller"
    );

    let store = Arc::new(MemoryDraftStore::new());
    let reconciler = Reconciler::new(
        config,
        Arc::new(PolicyConfigCache::new()),
        Arc::new(FailureTracker::new()),
        store.clone(),
    );
    let controller = ReportController::new(reconciler);

    let cancel = CancellationToken::new();
    let run = {
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = controller.run(cancel.clone()).await;
            // Stop reading input if the controller gave up on its own.
            cancel.cancel();
            result
        })
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(raw)) => {
                line_no += 1;
                match replay::parse_line(line_no, &raw) {
                    Ok(Some(event)) => replay::dispatch(&controller, event).await,
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Skipping unreadable input"),
                }
            }
            Ok(None) => {
                info!(lines = line_no, "Input closed, draining queue");
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = controller.wait_idle() => {}
                }
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }
    cancel.cancel();

    let outcome = match run.await {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Controller task failed: {e}");
            std::process::exit(1);
        }
    };

    for draft in store.snapshot() {
        match serde_json::to_string(&draft) {
            Ok(json) => println!("{json}"),
            Err(e) => error!(error = %e, "Failed to serialize draft"),
        }
    }

    let stats = controller.stats();
    info!(
        created = stats.created,
        patched = stats.patched,
        deleted = stats.deleted,
        deferred = stats.deferred,
        dropped = stats.dropped,
        "Replay finished"
    );

    if let Err(e) = outcome {
        eprintln!("Controller stopped: {e}");
        std::process::exit(1);
    }
}
