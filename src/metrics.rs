//! Metrics for the mesh control plane.
//!
//! Recorded through the `metrics` facade; install any exporter to collect
//! them.
//!
//! ## Available Metrics
//!
//! ### Counters
//! - `treemesh_frames_sent_total` - Frames queued on a connection
//! - `treemesh_frames_received_total` - Frames received from neighbours
//! - `treemesh_routes_unreachable_total` - Frames dropped for lack of a route
//! - `treemesh_connections_established_total` - Handshakes completed
//! - `treemesh_connections_dropped_total` - Connections closed
//! - `treemesh_blocklist_insertions_total` - Nodes blocklisted after repeated failures
//! - `treemesh_elections_started_total` - Local election rounds started
//! - `treemesh_elections_won_total` - Election rounds won
//! - `treemesh_promotions_total` - Promotions to bridge, by result
//! - `treemesh_queue_enqueued_total` - Messages accepted by the offline queue
//! - `treemesh_queue_dropped_total` - Messages refused or given up by the offline queue
//! - `treemesh_queue_evicted_total` - Messages evicted to make room
//! - `treemesh_queue_sent_total` - Messages drained toward the uplink
//!
//! ### Histograms
//! - `treemesh_time_adjustment_us` - Absolute clock adjustments applied
//!
//! ### Gauges
//! - `treemesh_connections` - Live connections
//! - `treemesh_known_nodes` - Nodes in the local tree view
//! - `treemesh_queue_size` - Messages in the offline queue
//! - `treemesh_time_offset_us` - Current mesh clock offset

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register metric descriptions.
///
/// Call once at startup, after installing an exporter.
pub fn init_metrics() {
    describe_counter!("treemesh_frames_sent_total", "Frames queued on a connection");
    describe_counter!(
        "treemesh_frames_received_total",
        "Frames received from neighbours"
    );
    describe_counter!(
        "treemesh_routes_unreachable_total",
        "Frames dropped because no route to the destination was known"
    );
    describe_counter!(
        "treemesh_connections_established_total",
        "Connections that completed the topology handshake"
    );
    describe_counter!("treemesh_connections_dropped_total", "Connections closed");
    describe_counter!(
        "treemesh_blocklist_insertions_total",
        "Nodes blocklisted after repeated connection failures"
    );
    describe_counter!(
        "treemesh_elections_started_total",
        "Bridge election rounds started locally"
    );
    describe_counter!("treemesh_elections_won_total", "Bridge election rounds won");
    describe_counter!(
        "treemesh_promotions_total",
        "Promotions to bridge, labelled by result"
    );
    describe_counter!(
        "treemesh_queue_enqueued_total",
        "Messages accepted by the offline queue"
    );
    describe_counter!(
        "treemesh_queue_dropped_total",
        "Messages refused or given up by the offline queue"
    );
    describe_counter!(
        "treemesh_queue_evicted_total",
        "Messages evicted from the offline queue to make room"
    );
    describe_counter!(
        "treemesh_queue_sent_total",
        "Messages drained from the offline queue toward the uplink"
    );

    describe_histogram!(
        "treemesh_time_adjustment_us",
        "Absolute clock adjustment per sync round in microseconds"
    );

    describe_gauge!("treemesh_connections", "Live connections");
    describe_gauge!("treemesh_known_nodes", "Nodes in the local tree view");
    describe_gauge!("treemesh_queue_size", "Messages in the offline queue");
    describe_gauge!("treemesh_time_offset_us", "Mesh clock offset in microseconds");
}

/// Record a frame queued for sending.
pub fn record_frame_sent() {
    counter!("treemesh_frames_sent_total").increment(1);
}

/// Record a frame received.
pub fn record_frame_received() {
    counter!("treemesh_frames_received_total").increment(1);
}

/// Record a frame dropped for lack of a route.
pub fn record_route_unreachable() {
    counter!("treemesh_routes_unreachable_total").increment(1);
}

/// Record a completed handshake.
pub fn record_connection_established() {
    counter!("treemesh_connections_established_total").increment(1);
}

/// Record a closed connection.
pub fn record_connection_dropped() {
    counter!("treemesh_connections_dropped_total").increment(1);
}

/// Record a blocklist insertion.
pub fn record_blocklisted() {
    counter!("treemesh_blocklist_insertions_total").increment(1);
}

/// Record a local election round.
pub fn record_election_started() {
    counter!("treemesh_elections_started_total").increment(1);
}

/// Record a won election round.
pub fn record_election_won() {
    counter!("treemesh_elections_won_total").increment(1);
}

/// Record the result of an uplink bring-up after promotion.
pub fn record_promotion(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!("treemesh_promotions_total", "result" => result).increment(1);
}

/// Record messages accepted by the offline queue.
pub fn record_queue_enqueued() {
    counter!("treemesh_queue_enqueued_total").increment(1);
}

/// Record messages refused or given up.
pub fn record_queue_dropped(count: usize) {
    counter!("treemesh_queue_dropped_total").increment(count as u64);
}

/// Record messages evicted for capacity.
pub fn record_queue_evicted(count: u64) {
    counter!("treemesh_queue_evicted_total").increment(count);
}

/// Record messages drained toward the uplink.
pub fn record_queue_sent(count: usize) {
    counter!("treemesh_queue_sent_total").increment(count as u64);
}

/// Record an applied clock adjustment.
pub fn record_time_adjustment(adjustment_us: i64) {
    histogram!("treemesh_time_adjustment_us").record(adjustment_us.unsigned_abs() as f64);
}

/// Update the connection gauge.
pub fn set_connections(count: usize) {
    gauge!("treemesh_connections").set(count as f64);
}

/// Update the known nodes gauge.
pub fn set_known_nodes(count: usize) {
    gauge!("treemesh_known_nodes").set(count as f64);
}

/// Update the queue size gauge.
pub fn set_queue_size(count: usize) {
    gauge!("treemesh_queue_size").set(count as f64);
}

/// Update the time offset gauge.
pub fn set_time_offset(offset_us: i64) {
    gauge!("treemesh_time_offset_us").set(offset_us as f64);
}
