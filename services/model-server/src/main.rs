use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dataplane_core::{init_metrics, init_tracing, DataPlane};
use model_server::config::{load_config, Cli};
use model_server::{build_repository, load_startup_models, run};
use tracing::info;

fn main() -> Result<()> {
    let cfg = load_config(Cli::parse())?;
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(n) = cfg.workers {
        builder.worker_threads(n.max(1));
    }
    let runtime = builder.enable_all().build()?;
    runtime.block_on(async move {
        init_tracing("model-server", &cfg.log_level, cfg.json_log)?;
        init_metrics();
        info!(target: "model-server", http = %cfg.http_addr(), grpc = %cfg.grpc_addr(), grpc_enabled = cfg.enable_grpc, "starting model server");

        let repo = build_repository(&cfg, None)?;
        load_startup_models(&repo, &cfg.model_names).await;
        let dataplane = Arc::new(DataPlane::new(repo, cfg.dataplane_config()));
        run(cfg, dataplane, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    })
}
