//! vmhub observability
//!
//! 提供统一的日志初始化、运行时日志级别调整和 span 辅助函数。

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::LogSettings;
pub use error::{ObservabilityError, Result};
pub use logging::{build_filter, create_call_span, create_connection_span, LogManager};
