//! 结构化日志模块
//!
//! 提供基于 tracing 的结构化日志功能。

use std::fmt::Display;
use std::net::SocketAddr;

use parking_lot::RwLock;
use tracing_subscriber::{
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::config::LogSettings;
use crate::error::{ObservabilityError, Result};

/// 日志级别重新加载句柄类型
type ReloadHandle = Handle<EnvFilter, Registry>;

/// 日志管理器
///
/// Owns the process-wide subscriber; only one may be initialised per process.
#[derive(Debug)]
pub struct LogManager {
    settings: RwLock<LogSettings>,
    reload_handle: ReloadHandle,
}

impl LogManager {
    /// 初始化日志系统并安装全局 subscriber
    pub fn init(settings: LogSettings) -> Result<Self> {
        let filter = build_filter(&settings)?;
        let (filter, reload_handle) = reload::Layer::new(filter);
        let registry = tracing_subscriber::registry().with(filter);

        let installed = if settings.json_format {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(settings.include_target)
                .with_current_span(true)
                .with_ansi(false);
            registry.with(layer).try_init()
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(settings.include_target)
                .with_ansi(settings.ansi_colors);
            registry.with(layer).try_init()
        };
        installed.map_err(|e| ObservabilityError::init(e.to_string()))?;

        tracing::info!(
            target: "vmhub_observability",
            "Log manager initialized with level: {}",
            settings.level
        );

        Ok(Self {
            settings: RwLock::new(settings),
            reload_handle,
        })
    }

    /// 动态更新日志级别，保留模块级别的配置
    pub fn update_level(&self, level: &str) -> Result<()> {
        let mut next = self.settings();
        next.level = level.to_string();
        self.apply(next)
    }

    /// 应用新的过滤配置
    ///
    /// Output format is fixed at initialisation; a changed `json_format` is
    /// ignored.
    pub fn apply(&self, mut settings: LogSettings) -> Result<()> {
        let new_filter = build_filter(&settings)?;
        self.reload_handle
            .reload(new_filter)
            .map_err(|e| ObservabilityError::logging(format!("Failed to update log level: {}", e)))?;

        let mut current = self.settings.write();
        settings.json_format = current.json_format;
        *current = settings;

        tracing::info!(
            target: "vmhub_observability",
            "Log level updated to: {}",
            current.level
        );
        Ok(())
    }

    /// 获取当前配置
    pub fn settings(&self) -> LogSettings {
        self.settings.read().clone()
    }
}

/// 构建环境过滤器
pub fn build_filter(settings: &LogSettings) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&settings.level)
        .map_err(|e| ObservabilityError::config(format!("Invalid log level: {}", e)))?;

    // 添加模块级别的过滤器
    for (module, level) in &settings.module_levels {
        let directive = format!("{}={}", module, level)
            .parse()
            .map_err(|e| ObservabilityError::config(format!("Invalid directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}

/// 创建带有连接上下文的 span
pub fn create_connection_span(connection_id: &str, addr: SocketAddr) -> tracing::Span {
    tracing::info_span!(
        "connection",
        connection_id = %connection_id,
        addr = %addr,
    )
}

/// 创建一次 view-model 调用的 span
pub fn create_call_span(
    kind: impl Display,
    connection_id: &str,
    vm_id: &str,
    caller: &str,
) -> tracing::Span {
    tracing::info_span!(
        "vm_call",
        kind = %kind,
        connection_id = %connection_id,
        vm_id = %vm_id,
        caller = %caller,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_with_modules() {
        let settings = LogSettings::default()
            .with_level("warn")
            .with_module_level("vmhub_session", "debug");

        let filter = build_filter(&settings).unwrap().to_string();
        assert!(filter.contains("warn"));
        assert!(filter.contains("vmhub_session=debug"));
    }

    #[test]
    fn test_build_filter_rejects_bad_directive() {
        let settings = LogSettings::default().with_module_level("vmhub_session", "loud");
        let err = build_filter(&settings).unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_log_manager_init_and_update() {
        let settings = LogSettings::default()
            .with_level("info")
            .with_module_level("vmhub_gateway", "debug");
        let manager = LogManager::init(settings).unwrap();

        manager.update_level("debug").unwrap();
        let current = manager.settings();
        assert_eq!(current.level, "debug");
        assert_eq!(current.module_levels["vmhub_gateway"], "debug");

        assert!(manager.update_level("vmhub=loud").is_err());
        assert_eq!(manager.settings().level, "debug");

        // the global subscriber is already taken
        assert!(LogManager::init(LogSettings::default()).is_err());
    }

    #[test]
    fn test_create_spans() {
        let subscriber = tracing_subscriber::registry();
        tracing::subscriber::with_default(subscriber, || {
            let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
            let span = create_connection_span("conn-1", addr);
            assert_eq!(span.metadata().unwrap().name(), "connection");

            let span = create_call_span("update", "conn-1", "Counter", "anonymous");
            assert_eq!(span.metadata().unwrap().name(), "vm_call");
        });
    }
}
