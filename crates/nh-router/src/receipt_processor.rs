//! Side-effecting observers invoked once per completed [`Receipt`].
//!
//! Grounded in `fc-router::mediator`'s post-send logging calls, generalized
//! into a small observer trait so a metrics sink can be added without the
//! Dispatcher knowing about it.

use metrics::{counter, histogram};

use nh_common::model::{Receipt, ReceiptStatus};

/// Called once, synchronously, after a [`Receipt`] reaches its final state
/// for one `Send` call. Implementors must not panic; the Dispatcher catches
/// panics defensively but a handler that panics on every call is dropped
/// from future dispatch in all but name — nothing re-enables it.
pub trait ReceiptHandler: Send + Sync {
    fn handle(&self, receipt: &Receipt);
}

/// Logs one line per receipt via `tracing`, at a level proportional to how
/// bad the outcome was.
pub struct LoggingReceiptHandler;

impl ReceiptHandler for LoggingReceiptHandler {
    fn handle(&self, receipt: &Receipt) {
        let status = receipt.status();
        let total = receipt.total();
        let failed = receipt.failed();
        match status {
            ReceiptStatus::Success => {
                tracing::info!(message_id = %receipt.message_id, total, "dispatch succeeded");
            }
            ReceiptStatus::Partial => {
                tracing::warn!(message_id = %receipt.message_id, total, failed, "dispatch partially failed");
            }
            ReceiptStatus::Failed => {
                tracing::error!(message_id = %receipt.message_id, total, "dispatch failed on every target");
            }
            ReceiptStatus::Pending | ReceiptStatus::Processing => {
                tracing::debug!(message_id = %receipt.message_id, "receipt handler invoked before completion");
            }
        }
    }
}

/// Emits dispatch metrics via the `metrics` crate: a message counter, a
/// per-platform success/failure counter, and a duration histogram keyed by
/// status. Install a recorder (e.g. `metrics-exporter-prometheus`) at the
/// application boundary to actually collect these; without one the macros
/// are no-ops.
#[derive(Default)]
pub struct MetricsReceiptHandler;

impl MetricsReceiptHandler {
    pub fn new() -> Self {
        Self
    }
}

impl ReceiptHandler for MetricsReceiptHandler {
    fn handle(&self, receipt: &Receipt) {
        counter!("notifyhub_messages_dispatched_total").increment(1);

        for result in receipt.results() {
            let status = if result.success { "success" } else { "failure" };
            counter!(
                "notifyhub_targets_total",
                "platform" => result.platform.clone(),
                "status" => status.to_string()
            )
            .increment(1);
            histogram!(
                "notifyhub_send_duration_seconds",
                "status" => status.to_string()
            )
            .record(result.duration.as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nh_common::model::PlatformResult;
    use std::time::Duration;

    #[test]
    fn metrics_handler_does_not_panic_without_a_recorder_installed() {
        let handler = MetricsReceiptHandler::new();

        let r1 = Receipt::new("m-1");
        r1.add_result(PlatformResult::success("email", "a", "id", Duration::from_millis(1)));
        handler.handle(&r1);

        let r2 = Receipt::new("m-2");
        r2.add_result(PlatformResult::failure("email", "b", "err", Duration::from_millis(1)));
        r2.add_result(PlatformResult::success("webhook", "c", "id", Duration::from_millis(1)));
        handler.handle(&r2);
    }

    #[test]
    fn logging_handler_does_not_panic_on_any_status() {
        let handler = LoggingReceiptHandler;
        let pending = Receipt::new("m-pending");
        handler.handle(&pending);

        let success = Receipt::new("m-success");
        success.add_result(PlatformResult::success("email", "a", "id", Duration::from_millis(1)));
        handler.handle(&success);
    }
}
