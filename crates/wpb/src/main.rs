use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wpb_bridge::BridgeConnector;
use wpb_core::{
    config::Config,
    creds::FileCredentialStore,
    service::{PairingService, ServiceSettings},
};
use wpb_http::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wpb_core::logging::init("wpb")?;

    let cfg = Config::load().context("loading configuration")?;
    tokio::fs::create_dir_all(&cfg.session_dir)
        .await
        .with_context(|| format!("creating session dir {}", cfg.session_dir.display()))?;

    info!(
        session_dir = %cfg.session_dir.display(),
        bridge = %cfg.bridge_path.display(),
        "starting pairing service"
    );

    let connector = Arc::new(BridgeConnector::new(
        cfg.bridge_path.clone(),
        cfg.bridge_args.clone(),
    ));
    let creds = Arc::new(FileCredentialStore::new(cfg.session_dir.clone()));
    let service = PairingService::new(connector, creds, ServiceSettings::from_config(&cfg));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let served = wpb_http::serve(cfg.bind_addr(), AppState::new(service.clone()), shutdown).await;
    service.shutdown();
    served
}
