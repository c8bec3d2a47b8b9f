//! sentinel-core 主入口
//! 运行后台任务，或执行一次性的审计校验、密钥集导出、合规报告。

use anyhow::Context;
use chrono::Duration;
use sentinel_core::{
    config::AppConfig, services::ReportKind, state::AppState, telemetry, workers,
};
use std::sync::mpsc;

enum Command {
    Run,
    VerifyAudit,
    Jwks,
    Report(i64),
    Controls,
}

fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    let command = match args.get(1).map(String::as_str) {
        None => Command::Run,
        Some("--version") => {
            println!("sentinel-core {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") => {
            print_help();
            return Ok(());
        }
        Some("--verify-audit") => Command::VerifyAudit,
        Some("--jwks") => Command::Jwks,
        Some("--controls") => Command::Controls,
        Some("--report-days") => {
            let days = args
                .get(2)
                .context("--report-days requires a number of days")?
                .parse::<i64>()
                .context("--report-days expects an integer")?;
            if days <= 0 {
                anyhow::bail!("--report-days must be positive");
            }
            Command::Report(days)
        }
        Some(other) => {
            eprintln!("未知参数: {}", other);
            print_help();
            std::process::exit(1);
        }
    };

    // 加载 .env 文件：.env.local > .env
    if let Ok(env) = std::env::var("SENTINEL_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志与指标
    telemetry::init_telemetry(&config.logging);
    telemetry::init_metrics();

    // 3. 构建服务
    let state = AppState::from_config(config).context("Failed to initialize services")?;

    match command {
        Command::VerifyAudit => {
            let report = state.audit.verify_integrity(None, None)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.passed {
                std::process::exit(2);
            }
        }
        Command::Jwks => {
            println!("{}", serde_json::to_string_pretty(&state.tokens.jwks())?);
        }
        Command::Report(days) => {
            let to = state.clock.now();
            let report = state.compliance.generate_compliance_report(
                to - Duration::days(days),
                to,
                ReportKind::Security,
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Controls => {
            let report = state.compliance.verify_compliance_controls()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run => run(&state)?,
    }

    Ok(())
}

/// 运行后台任务，直到收到 SIGINT / SIGTERM
fn run(state: &AppState) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        // 重复信号时接收端可能已退出
        let _ = shutdown_tx.send(());
    })
    .context("Failed to install signal handler")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "sentinel-core running; press Ctrl+C to stop"
    );

    let stopped = workers::run_until(state, shutdown_rx)
        .context("Failed to start background workers")?;
    tracing::info!(workers = stopped, "Shutdown complete");
    Ok(())
}

/// 打印帮助信息
fn print_help() {
    println!("sentinel-core {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: sentinel-core [选项]");
    println!();
    println!("选项:");
    println!("  --version          打印版本信息并退出");
    println!("  --help             打印此帮助信息并退出");
    println!("  --verify-audit     校验整条审计哈希链，失败时退出码为 2");
    println!("  --jwks             输出当前公钥集（JWKS）");
    println!("  --report-days N    输出最近 N 天的合规报告");
    println!("  --controls         执行合规控制自检");
    println!();
    println!("不带参数时运行后台任务（会话清理、密钥轮换、令牌清理），收到 Ctrl+C 或 SIGTERM 后退出。");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 SENTINEL_ 前缀的环境变量完成，层级用 __ 分隔");
    println!("  例如 SENTINEL_STORAGE__BACKEND=file");
}
