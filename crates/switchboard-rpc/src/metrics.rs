//! Metric names recorded by request handling.

/// Requests dispatched (counter, labels: action).
pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
/// Failed requests (counter, labels: action, error_type).
pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
/// Handler latency (histogram, labels: action).
pub const RPC_REQUEST_DURATION_SECONDS: &str = "rpc_request_duration_seconds";
