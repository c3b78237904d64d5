mod config;
mod handlers;
mod health;

use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use clap::Parser;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use webhook_admission::client::{ClientManager, DnsServiceResolver};
use webhook_admission::dispatcher::WebhookCaller;
use webhook_admission::metrics::AdmissionMetrics;
use webhook_admission::object::DynamicObjects;
use webhook_admission::plugin::{MutatingWebhookPlugin, ValidatingWebhookPlugin};
use webhook_admission::tls;
use webhook_admission::webhook::selector::NamespaceLister;
use webhook_admission::webhook::source::{
    ConfigurationManager, WebhookSource, namespace_reflector, run_cluster_source, run_file_source,
};

use crate::config::{GatewayConfig, SourceKind};

#[derive(Parser)]
#[command(name = "webhook-admission", about = "Kubernetes admission webhook gateway")]
struct Cli {
    /// Path to the configuration file
    #[arg(
        long,
        default_value = "/etc/webhook-admission/config.yaml",
        env = "WEBHOOK_ADMISSION_CONFIG"
    )]
    config: String,
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
                _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
            },
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                if let Err(e) = ctrl_c.await {
                    error!("failed to listen for ctrl_c: {e}");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            error!("failed to listen for ctrl_c: {e}");
        }
        info!("received CTRL+C, starting graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}

async fn run_https_server(
    addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    router: Router,
    serving: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, "failed to bind HTTPS listener: {e}");
            return;
        }
    };

    info!(%addr, "HTTPS admission server listening");
    serving.store(true, Ordering::Relaxed);

    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept TCP connection: {e}");
                        continue;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("HTTPS server shutting down");
                break;
            }
        };

        let tls_acceptor = tls_acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(%remote_addr, "TLS handshake failed: {e}");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(router.into_service());

            if let Err(e) = HttpBuilder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!(%remote_addr, "error serving connection: {e}");
            }
        });
    }
}

async fn run_http_server(addr: SocketAddr, router: Router, mut shutdown_rx: watch::Receiver<()>) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, "failed to bind HTTP listener: {e}");
            return;
        }
    };

    info!(%addr, "HTTP metrics/health server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("HTTP server shutting down");
        })
        .await
        .unwrap_or_else(|e| error!("HTTP server error: {e}"));
}

fn parse_addr(name: &str, value: &str) -> SocketAddr {
    value.parse().unwrap_or_else(|e| {
        eprintln!("Invalid {name} '{value}': {e}");
        exit(1);
    })
}

/// Starts keeping both configuration snapshots current and returns the
/// namespace lister matching the configured source.
async fn start_sources(
    config: &GatewayConfig,
    mutating: Arc<ConfigurationManager<MutatingWebhookConfiguration>>,
    validating: Arc<ConfigurationManager<ValidatingWebhookConfiguration>>,
    shutdown_rx: watch::Receiver<()>,
) -> Result<Arc<dyn NamespaceLister>, kube::Error> {
    match config.webhooks.source {
        SourceKind::File => {
            tokio::spawn(run_file_source(
                config.webhooks.path.clone(),
                config.webhooks.reload_interval(),
                mutating,
                validating,
                shutdown_rx,
            ));
            Ok(Arc::new(config.namespace_lister()))
        }
        SourceKind::Cluster => {
            let client = kube::Client::try_default().await?;
            tokio::spawn(run_cluster_source(client.clone(), mutating));
            tokio::spawn(run_cluster_source(client.clone(), validating));
            let (namespaces, driver) = namespace_reflector(client);
            tokio::spawn(driver);
            Ok(Arc::new(namespaces))
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = GatewayConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load config from {}: {e}", cli.config);
        exit(1);
    });

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("a process-wide CryptoProvider was already installed");
    }

    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        source = ?config.webhooks.source,
        client.cache_size = config.client.cache_size,
        client.default_timeout_seconds = config.client.default_timeout_seconds,
        equivalent_resource_groups = config.equivalent_resources.len(),
        "webhook-admission starting"
    );

    let tls_config = tls::load_tls_config(&config.tls_cert_path, &config.tls_key_path)
        .unwrap_or_else(|e| {
            eprintln!("Failed to load TLS config: {e}");
            exit(1);
        });
    let tls_acceptor = TlsAcceptor::from(tls_config);

    let auth = config.authentication_resolver().unwrap_or_else(|e| {
        eprintln!("Failed to load webhook client credentials: {e}");
        exit(1);
    });
    let clients = ClientManager::new(config.client.cache_size)
        .with_authentication_info_resolver(Arc::new(auth))
        .with_service_resolver(Arc::new(DnsServiceResolver));
    if let Err(e) = clients.validate() {
        eprintln!("Invalid client manager: {e}");
        exit(1);
    }
    let clients = Arc::new(clients);

    let mut registry = Registry::default();
    let metrics = Arc::new(AdmissionMetrics::new(&mut registry));
    let registry = Arc::new(registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let mutating_source = Arc::new(ConfigurationManager::<MutatingWebhookConfiguration>::new());
    let validating_source = Arc::new(ConfigurationManager::<ValidatingWebhookConfiguration>::new());
    let namespaces = start_sources(
        &config,
        mutating_source.clone(),
        validating_source.clone(),
        shutdown_rx.clone(),
    )
    .await
    .unwrap_or_else(|e| {
        eprintln!("Failed to connect to the cluster: {e}");
        exit(1);
    });

    let caller = || {
        WebhookCaller::new(clients.clone(), metrics.clone())
            .with_default_timeout(config.client.default_timeout())
    };
    let ready_timeout = config.client.ready_timeout();
    let app_state = Arc::new(handlers::AppState {
        mutating: MutatingWebhookPlugin::new(mutating_source.clone(), namespaces.clone(), caller())
            .with_ready_timeout(ready_timeout),
        validating: ValidatingWebhookPlugin::new(validating_source.clone(), namespaces, caller())
            .with_ready_timeout(ready_timeout),
        objects: DynamicObjects::new(Arc::new(config.equivalent_resource_registry())),
        metrics,
    });

    let webhook_router = Router::new()
        .route("/validate", post(handlers::handle_validate))
        .route("/mutate", post(handlers::handle_mutate))
        .layer(DefaultBodyLimit::max(3 * 1024 * 1024))
        .with_state(app_state);

    let serving = Arc::new(AtomicBool::new(false));
    let sources: Vec<Arc<dyn WebhookSource>> = vec![mutating_source as Arc<dyn WebhookSource>, validating_source];
    let health_state = Arc::new(health::HealthState {
        registry,
        serving: serving.clone(),
        sources,
    });

    let metrics_router = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics_handler))
        .with_state(health_state);

    let listen_addr = parse_addr("listen_addr", &config.listen_addr);
    let metrics_addr = parse_addr("metrics_addr", &config.metrics_addr);

    let https_shutdown_rx = shutdown_rx.clone();
    let http_shutdown_rx = shutdown_rx;

    tokio::spawn(shutdown_signal(shutdown_tx));

    tokio::join!(
        run_https_server(listen_addr, tls_acceptor, webhook_router, serving, https_shutdown_rx),
        run_http_server(metrics_addr, metrics_router, http_shutdown_rx),
    );

    info!("webhook-admission shut down gracefully");
}
