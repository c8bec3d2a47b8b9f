//! 测试公共模块
//! 提供测试配置、手动时钟与完整服务栈

#![allow(dead_code)]

use sentinel_core::{
    clock::ManualClock,
    config::{
        AccessConfig, AppConfig, LoggingConfig, MonitorConfig, SecurityConfig, SessionConfig,
        StorageConfig, TokenConfig, WorkerConfig,
    },
    models::{AuditFilter, AuthEventKind, CreateUserRequest, Origin, Role, User},
    repository::{MemoryStore, SharedStore},
    state::AppState,
};
use std::sync::Arc;

pub const PASSWORD: &str = "Str0ng!Passw0rd";

/// 创建测试配置
pub fn create_test_config() -> AppConfig {
    AppConfig {
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
        storage: StorageConfig {
            backend: "memory".to_string(),
            data_dir: "./data".to_string(),
        },
        security: SecurityConfig {
            password_min_length: 8,
            password_require_uppercase: true,
            password_require_lowercase: true,
            password_require_digit: true,
            password_require_special: true,
            password_expiry_days: 90,
            password_history: 5,
            max_failed_attempts: 5,
            // 测试中使用最低开销
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            allow_weak_kdf: true,
        },
        session: SessionConfig {
            ttl_secs: 8 * 3600,
            activity_timeout_secs: 2 * 3600,
            max_concurrent_sessions: 3,
            max_extension_hours: 24,
        },
        token: TokenConfig {
            issuer: "sentinel-test".to_string(),
            audience: "sentinel-test-clients".to_string(),
            access_token_exp_secs: 900,
            refresh_token_exp_secs: 7 * 86400,
            clock_skew_secs: 30,
            rsa_key_bits: 2048,
            key_rotation_interval_secs: 86400,
            key_grace_secs: 3600,
            bootstrap_private_key: None,
        },
        monitor: MonitorConfig {
            failed_login_threshold: 5,
            failed_login_window_secs: 15 * 60,
            permission_violation_threshold: 10,
            permission_violation_window_secs: 3600,
            origin_activity_threshold: 20,
            origin_activity_window_secs: 3600,
            distinct_login_origins: 3,
            distinct_login_window_secs: 30 * 60,
            window_capacity: 10_000,
            window_max_age_secs: 3600,
        },
        workers: WorkerConfig {
            session_sweep_interval_secs: 60,
            token_cleanup_interval_secs: 3600,
            key_rotation_check_interval_secs: 300,
        },
        access: AccessConfig {
            business_hours_start: 9,
            business_hours_end: 17,
        },
    }
}

/// 完整服务栈 + 手动时钟
pub struct TestApp {
    pub clock: ManualClock,
    pub store: SharedStore,
    pub state: AppState,
}

pub fn create_test_app() -> TestApp {
    create_test_app_with(create_test_config(), Arc::new(MemoryStore::new()), ManualClock::starting_now())
}

pub fn create_test_app_with(config: AppConfig, store: SharedStore, clock: ManualClock) -> TestApp {
    let state = AppState::build(config, store.clone(), Arc::new(clock.clone()))
        .expect("Failed to build service stack");
    TestApp { clock, store, state }
}

pub fn origin(ip: &str) -> Origin {
    Origin::new(ip, Some("integration-test"))
}

impl TestApp {
    /// 创建测试用户（无操作者）
    pub fn create_user(&self, username: &str, roles: &[Role]) -> User {
        self.state
            .credentials
            .create_user(
                CreateUserRequest::new(username, &format!("{}@example.com", username), PASSWORD, roles),
                None,
            )
            .expect("Failed to create test user")
    }

    pub fn count_events(&self, kind: AuthEventKind) -> usize {
        self.state
            .audit
            .search(&AuditFilter {
                kind: Some(kind),
                ..Default::default()
            })
            .expect("audit search failed")
            .len()
    }
}
