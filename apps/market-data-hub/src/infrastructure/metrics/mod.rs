//! Prometheus Metrics Module
//!
//! Exposes hub metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Delivery**: Frames delivered and failed deliveries per channel
//! - **Connections**: Live client connections
//! - **Subscriptions**: Active subscriptions per channel
//! - **Routing**: Events routed by kind and routing latency
//! - **Client errors**: Error replies by code
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::subscription::ChannelKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_hub_messages_delivered_total",
        "Total frames queued to client connections"
    );
    describe_counter!(
        "market_hub_deliveries_failed_total",
        "Total deliveries that failed and dropped the connection"
    );

    describe_gauge!(
        "market_hub_connections",
        "Number of live client connections"
    );
    describe_gauge!(
        "market_hub_subscriptions",
        "Number of active subscriptions per channel"
    );

    describe_counter!(
        "market_hub_events_routed_total",
        "Total domain events routed to socket managers"
    );
    describe_counter!(
        "market_hub_client_errors_total",
        "Total error replies sent to clients"
    );

    describe_histogram!(
        "market_hub_event_routing_seconds",
        "Time to route one domain event to all interested connections"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record frames queued to connections on a channel.
pub fn record_messages_delivered(channel: ChannelKind, count: u64) {
    counter!(
        "market_hub_messages_delivered_total",
        "channel" => channel.as_str()
    )
    .increment(count);
}

/// Record a failed delivery on a channel.
pub fn record_delivery_failed(channel: ChannelKind) {
    counter!(
        "market_hub_deliveries_failed_total",
        "channel" => channel.as_str()
    )
    .increment(1);
}

/// Update the live connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_connections(count: usize) {
    gauge!("market_hub_connections").set(count as f64);
}

/// Update the subscription count for a channel.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(channel: ChannelKind, count: usize) {
    gauge!(
        "market_hub_subscriptions",
        "channel" => channel.as_str()
    )
    .set(count as f64);
}

/// Record a routed domain event.
pub fn record_event_routed(event: &'static str) {
    counter!(
        "market_hub_events_routed_total",
        "event" => event
    )
    .increment(1);
}

/// Record an error reply to a client.
pub fn record_client_error(code: &'static str) {
    counter!(
        "market_hub_client_errors_total",
        "code" => code
    )
    .increment(1);
}

/// Record how long routing one event took.
pub fn record_routing_duration(duration: Duration) {
    histogram!("market_hub_event_routing_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
