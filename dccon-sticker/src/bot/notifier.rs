//! Delivers the terminal message of every finished job.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::jobs::{CancelReason, JobOutcome, JobReport};
use crate::telegram::{ChatPlatform, sticker_set_link};

/// Messages for the requester of a finished job.
///
/// A job the requester cancelled themselves produces nothing: the cancel
/// confirmation was already their terminal message.
pub fn report_messages(report: &JobReport) -> Vec<String> {
    let pack_id = report.request.pack_id;
    match &report.outcome {
        JobOutcome::Completed { set_names, .. } => {
            set_names.iter().map(|name| sticker_set_link(name)).collect()
        }
        JobOutcome::Failed { .. } => vec![format!("Failed to convert dccon {pack_id}.")],
        JobOutcome::Cancelled(CancelReason::Shutdown) => vec![format!(
            "Dccon {pack_id} was cancelled because the bot is shutting down."
        )],
        JobOutcome::Cancelled(CancelReason::Requested) => Vec::new(),
    }
}

/// Forward reports to their chats until the controller goes away.
pub async fn deliver_reports(platform: Arc<dyn ChatPlatform>, mut reports: mpsc::UnboundedReceiver<JobReport>) {
    while let Some(report) = reports.recv().await {
        for text in report_messages(&report) {
            if let Err(e) = platform.send_message(report.request.chat_id, &text).await {
                warn!(chat_id = report.request.chat_id, pack_id = %report.request.pack_id, error = %e, "Failed to deliver job result");
            }
        }
    }
    debug!("Job report channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Identity, PackId};
    use crate::jobs::JobRequest;

    fn report(outcome: JobOutcome) -> JobReport {
        JobReport {
            request: JobRequest {
                identity: Identity(1),
                pack_id: PackId(9),
                chat_id: 1,
                split_overflow: false,
            },
            outcome,
        }
    }

    #[test]
    fn test_completed_sends_one_link_per_set() {
        let messages = report_messages(&report(JobOutcome::Completed {
            title: "t".to_string(),
            set_names: vec!["abcde9_by_bot".to_string(), "fghij9_by_bot".to_string()],
        }));
        assert_eq!(
            messages,
            vec![
                "https://t.me/addstickers/abcde9_by_bot",
                "https://t.me/addstickers/fghij9_by_bot"
            ]
        );
    }

    #[test]
    fn test_failure_and_shutdown_notify() {
        assert_eq!(
            report_messages(&report(JobOutcome::Failed {
                reason: "x".to_string()
            }))
            .len(),
            1
        );
        assert_eq!(
            report_messages(&report(JobOutcome::Cancelled(CancelReason::Shutdown))).len(),
            1
        );
        assert!(report_messages(&report(JobOutcome::Cancelled(CancelReason::Requested))).is_empty());
    }
}
