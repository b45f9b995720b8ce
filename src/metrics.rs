//! Prometheus metrics for the exchange.
//!
//! A recorder is installed once at startup; its handle renders the text
//! exposition served at `/metrics`. When no recorder is installed (tests,
//! one-shot subcommands) the `metrics` macros are no-ops.

use std::sync::OnceLock;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

use crate::domain::{Direction, OrderKind};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub const ORDERS_PLACED: &str = "tochka_orders_placed_total";
pub const ORDERS_REJECTED: &str = "tochka_orders_rejected_total";
pub const ORDERS_CANCELLED: &str = "tochka_orders_cancelled_total";
pub const TRADES_EXECUTED: &str = "tochka_trades_executed_total";
pub const TRADED_VOLUME: &str = "tochka_traded_volume_total";
pub const ORDER_PLACEMENT_DURATION: &str = "tochka_order_placement_duration_seconds";

/// Installs the Prometheus recorder. Idempotent.
pub fn init_metrics() {
    if HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if HANDLE.set(handle).is_ok() {
                describe();
                info!("Prometheus recorder installed");
            }
        }
        Err(e) => warn!("Failed to install Prometheus recorder: {}", e),
    }
}

fn describe() {
    metrics::describe_counter!(ORDERS_PLACED, "Orders accepted by the matching engine");
    metrics::describe_counter!(ORDERS_REJECTED, "Orders refused before matching");
    metrics::describe_counter!(ORDERS_CANCELLED, "Orders cancelled by their owner");
    metrics::describe_counter!(TRADES_EXECUTED, "Individual fills between two orders");
    metrics::describe_counter!(TRADED_VOLUME, "Units traded across all instruments");
    metrics::describe_histogram!(
        ORDER_PLACEMENT_DURATION,
        "Time from order validation to commit"
    );
}

/// Current exposition text, if a recorder is installed.
pub fn render() -> Option<String> {
    HANDLE.get().map(|handle| handle.render())
}

/// Metrics emitted by the exchange service.
pub struct ExchangeMetrics;

impl ExchangeMetrics {
    pub fn record_order_placed(kind: OrderKind, direction: Direction, elapsed: Duration) {
        metrics::counter!(
            ORDERS_PLACED,
            "kind" => kind.as_str(),
            "direction" => direction.as_str()
        )
        .increment(1);
        metrics::histogram!(ORDER_PLACEMENT_DURATION).record(elapsed.as_secs_f64());
    }

    pub fn record_order_rejected(reason: &'static str) {
        metrics::counter!(ORDERS_REJECTED, "reason" => reason).increment(1);
    }

    pub fn record_order_cancelled() {
        metrics::counter!(ORDERS_CANCELLED).increment(1);
    }

    pub fn record_trades(fills: usize, volume: i64) {
        metrics::counter!(TRADES_EXECUTED).increment(fills as u64);
        metrics::counter!(TRADED_VOLUME).increment(volume.max(0) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_harmless() {
        ExchangeMetrics::record_order_placed(
            OrderKind::Limit,
            Direction::Buy,
            Duration::from_millis(3),
        );
        ExchangeMetrics::record_order_rejected("insufficient_funds");
        ExchangeMetrics::record_trades(2, 10);
    }

    #[test]
    fn test_installed_recorder_renders_counters() {
        init_metrics();
        ExchangeMetrics::record_order_cancelled();

        let body = render().expect("recorder installed");
        assert!(body.contains(ORDERS_CANCELLED), "{body}");
    }
}
