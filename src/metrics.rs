use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use once_cell::sync::Lazy;

/// Global runtime metrics for the client.
///
/// Purpose:
/// - Track inbound frame volume and decode failures
/// - Track outbound events (sent vs. buffered before the handshake)
/// - Track acknowledgement correlation hits and misses
/// - Track reconnect activity
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // Inbound
    pub frames_received: AtomicUsize,
    pub frames_undecodable: AtomicUsize,

    // Outbound
    pub events_sent: AtomicUsize,
    pub events_buffered: AtomicUsize,

    // Acknowledgements
    pub results_matched: AtomicUsize,
    pub results_unmatched: AtomicUsize,

    // Dispatch
    pub channel_dispatches: AtomicUsize,
    pub global_dispatches: AtomicUsize,
    pub pings_answered: AtomicUsize,

    // Connection lifecycle
    pub reconnects: AtomicUsize,
    pub events_replayed: AtomicUsize,
    pub connect_timeouts: AtomicUsize,
    pub transport_closes: AtomicUsize,
    pub transport_errors: AtomicUsize,
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
