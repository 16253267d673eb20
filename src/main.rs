//! Fuyuka API 入口
//!
//! 读取配置（可选的第一个参数为额外的 TOML 文件）、初始化日志、组装上下文并启动 HTTP / WebSocket 服务。
//! 收到 Ctrl+C / SIGTERM 后停止接收请求，保存对话历史后退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use fuyuka::core::{HistoryCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use fuyuka::gateway::server;
use fuyuka::llm::GeminiBackend;
use fuyuka::{load_config, observability, AppContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    observability::init(config.app.log_file.as_deref()).context("Failed to init logging")?;

    let backend = GeminiBackend::new(config.google.base_url.clone(), config.google.timeout_secs)
        .context("Failed to create Gemini backend")?;
    let ctx = Arc::new(AppContext::build(config, Arc::new(backend))?);

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    tracing::info!(
        model = %ctx.config.google.model,
        keys = ctx.client.credentials().len(),
        "電脳娘フユカ (Fuyuka API) started"
    );

    if let Err(e) = server::serve(Arc::clone(&ctx), shutdown.token()).await {
        tracing::error!(error = %e, "server stopped with error");
        shutdown.shutdown(ShutdownReason::ServerError(e.to_string()));
    }

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(HistoryCleanup::new(Arc::clone(&ctx.client)));
    coordinator.run_cleanup().await;

    tracing::info!(reason = ?shutdown.reason(), "電脳娘フユカ (Fuyuka API) stopped");
    Ok(())
}
