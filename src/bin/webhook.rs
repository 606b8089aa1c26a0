use std::time::Duration;

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api,
};
use stopper::Stopper;

use cacerts_injector::{
    config::WebhookConfig, controller::NamespaceController, informer::Informer, queue::WorkQueue,
};

/// Generate future that awaits shutdown signal
async fn shutdown_signal(
    axum_server_handle: axum_server::Handle,
    stopper: Stopper,
    grace_period: Duration,
) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("terminate signal received");

    stopper.stop();
    axum_server_handle.graceful_shutdown(Some(grace_period));
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = WebhookConfig::try_from_env()?;
    let kube_config = kube::Config::infer().await?;
    let client: kube::Client = kube_config.try_into()?;

    // Prepare shutdown signal futures
    let stopper = Stopper::new();
    let axum_server_handle = axum_server::Handle::new();
    tokio::spawn(shutdown_signal(
        axum_server_handle.clone(),
        stopper.clone(),
        config.shutdown_grace_period(),
    ));

    // Prepare namespace informer. The watcher retries forever with backoff.
    let namespace_events = watcher(Api::<Namespace>::all(client.clone()), Default::default())
        .backoff(backoff::ExponentialBackoff {
            max_elapsed_time: None,
            ..backoff::ExponentialBackoff::default()
        });
    let informer = Informer::new(namespace_events);

    // Spawn namespace controller
    let controller =
        NamespaceController::new(client, WorkQueue::default(), config.cache_sync_timeout());
    let controller_state = controller.subscribe_state();
    let controller_handle = tokio::spawn({
        let stopper = stopper.clone();
        async move {
            // The webhook keeps serving already provisioned namespaces if this fails
            if let Err(error) = controller.run(informer, stopper).await {
                tracing::error!(%error, "namespace controller stopped");
            }
        }
    });
    tracing::info!("spawned namespace controller");

    // Prepare HTTP app
    let http_app = cacerts_injector::handler::create_app(controller_state);

    // Prepare TLS config for HTTPS serving
    let tls_config = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path).await?;

    tracing::info!(listen_addr = %config.listen_addr, "starting web server...");
    let res = axum_server::bind_rustls(config.listen_addr.parse()?, tls_config)
        .handle(axum_server_handle)
        .serve(http_app.into_make_service())
        .await;
    tracing::info!("web server terminated");

    // Make sure the controller stops even when the server failed on its own
    stopper.stop();
    controller_handle.await?;
    tracing::info!("namespace controller terminated");

    res?;

    Ok(())
}
