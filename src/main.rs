//! # LLM 渠道代理网关
//!
//! 单进程提供代理面与管理面：环境配置 -> 配置存储 -> 共享组件 ->
//! axum 服务，Ctrl+C 优雅退出并停止全部后台清扫任务。

use llm_gateway::logging::{init_logging, LogComponent, LogStage};
use llm_gateway::server::build_router;
use llm_gateway::{linfo, lwarn};
use llm_gateway::{AppState, EnvConfig};

#[tokio::main]
async fn main() -> llm_gateway::Result<()> {
    init_logging();

    let env = EnvConfig::from_env();
    let port = env.port;
    if env.proxy_access_key.is_empty() {
        lwarn!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "no_access_key",
            "未设置 PROXY_ACCESS_KEY，所有接口不鉴权（仅限内网部署）"
        );
    }

    let state = AppState::new(env)?;
    let router = build_router(state.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        llm_gateway::ProxyError::io(format!("监听 {addr} 失败"), e)
    })?;

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "server_started",
        &format!("服务已启动: http://{addr}")
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| llm_gateway::ProxyError::io("服务异常退出", e))?;

    state.shutdown();
    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "server_stopped",
        "服务已停止"
    );

    Ok(())
}
