/*!
 * Monitoring
 * Tracing setup and per-request spans
 */

mod tracer;

pub use tracer::{generate_trace_id, init_tracing, RequestSpan};
