//! 身份认证、访问控制与防篡改审计核心
//! 提供凭据、会话、令牌、权限、审计链与安全监控服务

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;
pub mod state;
pub mod telemetry;
pub mod workers;

pub use error::{AppError, Result};
pub use state::AppState;
