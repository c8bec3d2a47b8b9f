//! 日志与追踪系统
//! 初始化结构化日志和指标收集

use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 初始化日志与追踪系统
///
/// Returns false when a global subscriber was already installed.
pub fn init_telemetry(config: &LoggingConfig) -> bool {
    // RUST_LOG 优先于配置
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let log_layer = match config.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            level = %config.level,
            format = %config.format,
            "Telemetry initialized"
        );
    }
    installed
}

/// 初始化指标
///
/// metrics 0.24 在首次使用时创建指标；这里只登记说明文字。
pub fn init_metrics() {
    metrics::describe_counter!("sentinel_logins_total", "Login attempts by outcome");
    metrics::describe_counter!("sentinel_account_lockouts_total", "Accounts locked by failed logins");
    metrics::describe_counter!("sentinel_permission_checks_total", "Permission decisions by outcome");
    metrics::describe_counter!("sentinel_token_validations_total", "Bearer token validations by outcome");
    metrics::describe_counter!("sentinel_audit_events_total", "Audit records appended by kind");
    metrics::describe_counter!("sentinel_security_incidents_total", "Incidents raised by kind and severity");
    metrics::describe_gauge!("sentinel_active_sessions", "Sessions in the active index");
    tracing::debug!("Metrics initialized");
}
