//! 配置系统
//! 从环境变量加载所有配置（前缀 SENTINEL_），使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

/// Argon2id 最低内存开销（KiB），约 19 MiB
pub const MIN_ARGON2_MEMORY_KIB: u32 = 19456;
/// Argon2id 最低迭代次数
pub const MIN_ARGON2_ITERATIONS: u32 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// 存储后端: memory, file
    pub backend: String,
    /// 文件存储目录（backend = file 时使用）
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// 密码最小长度
    pub password_min_length: usize,
    /// 密码必须包含大写字母
    pub password_require_uppercase: bool,
    /// 密码必须包含小写字母
    pub password_require_lowercase: bool,
    /// 密码必须包含数字
    pub password_require_digit: bool,
    /// 密码必须包含特殊字符
    pub password_require_special: bool,
    /// 密码有效期（天）
    pub password_expiry_days: i64,
    /// 禁止重复使用的历史密码个数
    pub password_history: usize,
    /// 连续登录失败多少次后锁定账户
    pub max_failed_attempts: u32,
    /// Argon2 内存开销（KiB）
    pub argon2_memory_kib: u32,
    /// Argon2 迭代次数
    pub argon2_iterations: u32,
    /// Argon2 并行度
    pub argon2_parallelism: u32,
    /// 开发/测试模式：允许低于最低开销的 Argon2 参数
    pub allow_weak_kdf: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// 会话绝对有效期（秒）
    pub ttl_secs: i64,
    /// 空闲超时（秒）
    pub activity_timeout_secs: i64,
    /// 每个用户的并发会话上限
    pub max_concurrent_sessions: usize,
    /// 单次续期的最大小时数
    pub max_extension_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// 签发方（iss）
    pub issuer: String,
    /// 受众（aud）
    pub audience: String,
    /// 访问令牌过期时间（秒）
    pub access_token_exp_secs: i64,
    /// 刷新令牌过期时间（秒）
    pub refresh_token_exp_secs: i64,
    /// 允许的时钟偏差（秒）
    pub clock_skew_secs: i64,
    /// RSA 模数位数
    pub rsa_key_bits: usize,
    /// 签名密钥轮换周期（秒）
    pub key_rotation_interval_secs: i64,
    /// 旧密钥仅验证的宽限期（秒）
    pub key_grace_secs: i64,
    /// 可选：导入的初始签名私钥（PKCS#1 PEM）
    pub bootstrap_private_key: Option<Secret<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// 同一来源暴力破解阈值
    pub failed_login_threshold: usize,
    pub failed_login_window_secs: i64,
    /// 同一用户权限拒绝洪泛阈值
    pub permission_violation_threshold: usize,
    pub permission_violation_window_secs: i64,
    /// 单一来源高频活动阈值
    pub origin_activity_threshold: usize,
    pub origin_activity_window_secs: i64,
    /// 同一用户在窗口内允许的不同登录来源数
    pub distinct_login_origins: usize,
    pub distinct_login_window_secs: i64,
    /// 最近事件窗口容量
    pub window_capacity: usize,
    /// 最近事件窗口最大时长（秒）
    pub window_max_age_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// 会话清理间隔（秒）
    pub session_sweep_interval_secs: u64,
    /// 令牌清理间隔（秒）
    pub token_cleanup_interval_secs: u64,
    /// 密钥轮换检查间隔（秒）
    pub key_rotation_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// 工作时间窗口起始（UTC 小时）
    pub business_hours_start: u32,
    /// 工作时间窗口结束（UTC 小时，不含）
    pub business_hours_end: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    pub session: SessionConfig,
    pub token: TokenConfig,
    pub monitor: MonitorConfig,
    pub workers: WorkerConfig,
    pub access: AccessConfig,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        settings = settings
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("storage.backend", "memory")?
            .set_default("storage.data_dir", "./data")?
            .set_default("security.password_min_length", 8)?
            .set_default("security.password_require_uppercase", true)?
            .set_default("security.password_require_lowercase", true)?
            .set_default("security.password_require_digit", true)?
            .set_default("security.password_require_special", true)?
            .set_default("security.password_expiry_days", 90)?
            .set_default("security.password_history", 5)?
            .set_default("security.max_failed_attempts", 5)?
            .set_default("security.argon2_memory_kib", 19456)?
            .set_default("security.argon2_iterations", 2)?
            .set_default("security.argon2_parallelism", 1)?
            .set_default("security.allow_weak_kdf", false)?
            .set_default("session.ttl_secs", 8 * 3600)?
            .set_default("session.activity_timeout_secs", 2 * 3600)?
            .set_default("session.max_concurrent_sessions", 3)?
            .set_default("session.max_extension_hours", 24)?
            .set_default("token.issuer", "sentinel-core")?
            .set_default("token.audience", "sentinel-clients")?
            .set_default("token.access_token_exp_secs", 900)?
            .set_default("token.refresh_token_exp_secs", 7 * 86400)?
            .set_default("token.clock_skew_secs", 30)?
            .set_default("token.rsa_key_bits", 2048)?
            .set_default("token.key_rotation_interval_secs", 86400)?
            .set_default("token.key_grace_secs", 86400)?
            .set_default("monitor.failed_login_threshold", 5)?
            .set_default("monitor.failed_login_window_secs", 15 * 60)?
            .set_default("monitor.permission_violation_threshold", 10)?
            .set_default("monitor.permission_violation_window_secs", 3600)?
            .set_default("monitor.origin_activity_threshold", 20)?
            .set_default("monitor.origin_activity_window_secs", 3600)?
            .set_default("monitor.distinct_login_origins", 3)?
            .set_default("monitor.distinct_login_window_secs", 30 * 60)?
            .set_default("monitor.window_capacity", 10_000)?
            .set_default("monitor.window_max_age_secs", 3600)?
            .set_default("workers.session_sweep_interval_secs", 60)?
            .set_default("workers.token_cleanup_interval_secs", 3600)?
            .set_default("workers.key_rotation_check_interval_secs", 300)?
            .set_default("access.business_hours_start", 9)?
            .set_default("access.business_hours_end", 17)?;

        // 从环境变量加载配置（前缀为 SENTINEL_）
        settings = settings.add_source(
            Environment::with_prefix("SENTINEL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        match self.storage.backend.as_str() {
            "memory" | "file" => {}
            other => {
                return Err(ConfigError::Message(format!(
                    "Invalid storage backend: {}. Must be one of: memory, file",
                    other
                )))
            }
        }

        if self.security.password_min_length < 8 || self.security.password_min_length > 128 {
            return Err(ConfigError::Message(
                "password_min_length must be between 8 and 128".to_string(),
            ));
        }

        if self.security.max_failed_attempts < 1 || self.security.max_failed_attempts > 20 {
            return Err(ConfigError::Message(
                "max_failed_attempts must be between 1 and 20".to_string(),
            ));
        }

        if self.security.argon2_iterations < 1 || self.security.argon2_memory_kib < 8 {
            return Err(ConfigError::Message(
                "argon2 cost parameters are below the library minimum".to_string(),
            ));
        }

        if !self.security.allow_weak_kdf
            && (self.security.argon2_memory_kib < MIN_ARGON2_MEMORY_KIB
                || self.security.argon2_iterations < MIN_ARGON2_ITERATIONS)
        {
            return Err(ConfigError::Message(format!(
                "argon2 cost must be at least m={} KiB, t={} (set security.allow_weak_kdf for development)",
                MIN_ARGON2_MEMORY_KIB, MIN_ARGON2_ITERATIONS
            )));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(ConfigError::Message(
                "max_concurrent_sessions must be at least 1".to_string(),
            ));
        }

        if self.session.max_extension_hours < 1 || self.session.max_extension_hours > 24 * 30 {
            return Err(ConfigError::Message(
                "max_extension_hours must be between 1 and 720".to_string(),
            ));
        }

        if self.session.ttl_secs <= 0 || self.session.activity_timeout_secs <= 0 {
            return Err(ConfigError::Message(
                "session ttl and activity timeout must be positive".to_string(),
            ));
        }

        if self.token.access_token_exp_secs < 60 || self.token.access_token_exp_secs > 86400 {
            return Err(ConfigError::Message(
                "access_token_exp_secs must be between 60 and 86400 (1 minute to 24 hours)"
                    .to_string(),
            ));
        }

        if self.token.refresh_token_exp_secs < self.token.access_token_exp_secs {
            return Err(ConfigError::Message(
                "refresh_token_exp_secs must not be shorter than access_token_exp_secs".to_string(),
            ));
        }

        if self.token.clock_skew_secs < 0 || self.token.clock_skew_secs > 300 {
            return Err(ConfigError::Message(
                "clock_skew_secs must be between 0 and 300".to_string(),
            ));
        }

        // ring 只接受 2048 位及以上的 RSA 密钥
        if self.token.rsa_key_bits < 2048 || self.token.rsa_key_bits > 8192 {
            return Err(ConfigError::Message(
                "rsa_key_bits must be between 2048 and 8192".to_string(),
            ));
        }

        // 宽限期至少要覆盖一个访问令牌的生命周期
        if self.token.key_grace_secs < self.token.access_token_exp_secs {
            return Err(ConfigError::Message(
                "key_grace_secs must be >= access_token_exp_secs".to_string(),
            ));
        }

        if let Some(pem) = &self.token.bootstrap_private_key {
            if !pem.expose_secret().contains("PRIVATE KEY") {
                return Err(ConfigError::Message(
                    "bootstrap_private_key must be a PEM encoded private key".to_string(),
                ));
            }
        }

        if self.workers.session_sweep_interval_secs == 0
            || self.workers.token_cleanup_interval_secs == 0
            || self.workers.key_rotation_check_interval_secs == 0
        {
            return Err(ConfigError::Message(
                "worker intervals must be at least 1 second".to_string(),
            ));
        }

        if self.access.business_hours_start >= self.access.business_hours_end
            || self.access.business_hours_end > 24
        {
            return Err(ConfigError::Message(
                "business hours must satisfy start < end <= 24".to_string(),
            ));
        }

        Ok(())
    }
}
