//! Turns the loaded [`Config`] into the runtime pieces

use std::sync::Arc;

use vmhub_config::{Config, LoggingConfig, PipelineConfig};
use vmhub_core::CallKind;
use vmhub_gateway::{GatewayOptions, WsConfig};
use vmhub_observability::LogSettings;
use vmhub_pipeline::{
    HeaderIdentityInterceptor, Interceptor, MaskInternalErrors, Pipeline, PlainIdentityExtractor,
    RoleAuthorizationFilter, TracingInterceptor,
};
use vmhub_session::FactoryConfig;

/// Tracing on every chain and role checks on every instance, plus the
/// optional identity header and error masking.
pub fn build_pipeline(config: &PipelineConfig) -> Pipeline {
    let mut builder = Pipeline::builder();

    if config.trust_identity_header {
        let identity: Arc<dyn Interceptor> = Arc::new(HeaderIdentityInterceptor::new(
            config.identity_header.clone(),
            PlainIdentityExtractor,
        ));
        for kind in [CallKind::Request, CallKind::Update, CallKind::Dispose] {
            builder = builder.intercept(kind, Arc::clone(&identity));
        }
    }

    builder = builder
        .around_all(Arc::new(TracingInterceptor::new()))
        .filter(RoleAuthorizationFilter::new());

    if config.mask_internal_errors {
        builder = builder.translate_with(MaskInternalErrors::new());
    }

    builder.build()
}

pub fn gateway_options(config: &Config) -> GatewayOptions {
    let factory = FactoryConfig::new()
        .with_idle_timeout(config.session.idle_timeout())
        .with_sweep_interval(config.session.sweep_interval());
    GatewayOptions::default()
        .with_factory(factory)
        .with_translate_update_errors(config.pipeline.translate_update_errors)
}

pub fn ws_config(config: &Config) -> WsConfig {
    WsConfig {
        bind: config.server.bind.clone(),
        max_connections: config.server.max_connections,
        heartbeat_interval_secs: config.server.heartbeat_interval_secs,
    }
}

pub fn log_settings(config: &LoggingConfig) -> LogSettings {
    let mut settings = LogSettings::default()
        .with_level(config.level.as_str())
        .with_json_format(config.json_format);
    for (module, level) in &config.module_levels {
        settings = settings.with_module_level(module.clone(), level.as_str());
    }
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use std::collections::BTreeMap;
    use vmhub_config::LogLevel;

    #[test]
    fn test_default_pipeline() {
        let pipeline = build_pipeline(&PipelineConfig::default());
        assert_eq!(pipeline.chain(CallKind::Request).names(), vec!["tracing"]);
        assert_eq!(pipeline.chain(CallKind::Disconnect).names(), vec!["tracing"]);
        assert_eq!(pipeline.filters().len(), 1);
        assert_eq!(pipeline.translator_count(), 0);
    }

    #[test]
    fn test_pipeline_switches() {
        let config = PipelineConfig {
            trust_identity_header: true,
            mask_internal_errors: true,
            ..PipelineConfig::default()
        };
        let pipeline = build_pipeline(&config);
        assert_eq!(
            pipeline.chain(CallKind::Update).names(),
            vec!["header-identity", "tracing"]
        );
        assert_eq!(pipeline.chain(CallKind::Response).names(), vec!["tracing"]);
        assert_eq!(pipeline.translator_count(), 1);
    }

    #[test]
    fn test_options_follow_config() {
        let mut config = Config::default();
        config.session.idle_timeout_secs = 90;
        config.session.sweep_interval_secs = 15;
        config.pipeline.translate_update_errors = false;

        let options = gateway_options(&config);
        assert_eq!(options.factory.idle_timeout, Duration::from_secs(90));
        assert_eq!(options.factory.sweep_interval, Duration::from_secs(15));
        assert!(!options.translate_update_errors);

        let ws = ws_config(&config);
        assert_eq!(ws.bind, "127.0.0.1:18790");
        assert_eq!(ws.max_connections, 1000);
    }

    #[test]
    fn test_log_settings() {
        let config = LoggingConfig {
            level: LogLevel::Warn,
            json_format: false,
            module_levels: BTreeMap::from([("vmhub_session".to_string(), LogLevel::Trace)]),
        };

        let settings = log_settings(&config);
        assert_eq!(settings.level, "warn");
        assert_eq!(settings.module_levels["vmhub_session"], "trace");
        assert!(!settings.json_format);
    }
}
