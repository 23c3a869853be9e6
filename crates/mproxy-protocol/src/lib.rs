pub mod claude;
pub mod sse;

pub use claude::error::{ErrorBody, ErrorDetail, anthropic_error_type};
