//! lbsync - Gateway API to load balancer synchronizer

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use lbsync_common::telemetry::init_telemetry;
use lbsync_operator::{
    Cli, GatewayTranslator, KubeEventSource, KubeResourceReader, KubeStatusWriter,
};
use lbsync_pipeline::{HttpRemoteClient, Pipeline, ShutdownSignal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(cli.telemetry())?;

    let (config, remote) = cli.into_configs();
    remote.validate()?;
    info!(
        cluster = %config.cluster_name,
        tenant = %config.tenant,
        controller = %remote.base_url,
        delete_config = config.delete_config,
        "starting lbsync"
    );

    let client = Client::try_default().await?;
    let watch_namespace = config.sync_namespace.clone();
    let reader = Arc::new(KubeResourceReader::new(client.clone()));
    let translator = GatewayTranslator::new(&config, reader);

    let shutdown = ShutdownSignal::new();
    let pipeline = Arc::new(
        Pipeline::builder(config)
            .remote_client(Arc::new(HttpRemoteClient::new(&remote)?))
            .translator(Arc::new(translator))
            .status_writer(Arc::new(KubeStatusWriter::new(client.clone())))
            .shutdown_signal(shutdown.clone())
            .build()?,
    );

    tokio::spawn(wait_for_signal(shutdown));

    let source = KubeEventSource::new(client, watch_namespace);
    if let Err(e) = pipeline.run(Box::new(source)).await {
        error!(error = %e, "lbsync stopped");
        return Err(e.into());
    }
    info!("lbsync stopped");
    Ok(())
}

/// Stop the pipeline on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: ShutdownSignal) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.stop();
}
