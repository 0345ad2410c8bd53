use std::sync::Arc;

use physics_bar::config::Config;
use physics_bar::handler::HostContext;
use physics_bar::host::ToolHost;
use physics_bar::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("info");

    let backend = Config::load().backend.with_env_overrides();
    tracing::info!(provider = ?backend.provider, model = %backend.model, host = %backend.host, "Starting tool host");

    let context = Arc::new(HostContext::new(backend));
    ToolHost::new(context)
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
}
