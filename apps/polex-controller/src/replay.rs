//! Newline-delimited JSON watch events.
//!
//! Each line is one event tagged by `type`:
//!
//! ```text
//! {"type":"manifestApplied","name":"disallow-privileged","mode":"warming"}
//! {"type":"manifestApplied","name":"require-labels","mode":"warming","exceptions":[{"namespaces":["shop"],"names":["web*"],"kind":["Deployment"]}]}
//! {"type":"report","scope":{"kind":"Deployment","name":"web","namespace":"shop"},"results":[...]}
//! {"type":"manifestDeleted","name":"disallow-privileged"}
//! ```
//!
//! Blank lines and lines starting with `#` are ignored.

use polex_reconciler::{ManifestEvent, PolicyManifest, ReportController, ReportEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// One watch event from the replay stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WatchEvent {
    Report(ReportEvent),
    ManifestApplied(PolicyManifest),
    ManifestDeleted { name: String },
}

/// Replay stream errors.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("line {line}: invalid watch event: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse one input line. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: usize, raw: &str) -> Result<Option<WatchEvent>, ReplayError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|source| ReplayError::Parse { line, source })
}

/// Hand an event to the controller. Rejected events are logged and skipped.
pub async fn dispatch(controller: &ReportController, event: WatchEvent) {
    let result = match event {
        WatchEvent::Report(report) => controller.submit(report).map(|_| ()),
        WatchEvent::ManifestApplied(manifest) => {
            controller
                .apply_manifest(&ManifestEvent::Applied(manifest))
                .await
        }
        WatchEvent::ManifestDeleted { name } => {
            controller
                .apply_manifest(&ManifestEvent::Deleted { name })
                .await
        }
    };
    if let Err(e) = result {
        warn!(error = %e, "Watch event rejected");
    }
}
