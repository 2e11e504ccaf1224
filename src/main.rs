//! CSI Driver Operator
//!
//! Process bootstrap: flag parsing, logging, health and metrics endpoints,
//! and the CsiDeployment controller. All configuration is read here, once,
//! and passed into the core as an immutable [`OperatorConfig`].

use anyhow::Context;
use clap::Parser;
use kube::CustomResourceExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use csi_driver_operator::crd::CsiDeployment;
use csi_driver_operator::{run_controller, CephConfig, CloudConfig, OperatorConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CSI Driver Operator - deploys and converges CSI storage drivers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the kubelet's root dir on every node
    #[arg(long, env = "KUBELET_ROOT_DIR", default_value = "/var/lib/kubelet")]
    kubelet_root_dir: String,

    /// Domain of the image registry for driver and sidecar images
    #[arg(
        long,
        env = "REGISTRY_DOMAIN",
        default_value = "registry.billyronks.io/library"
    )]
    registry_domain: String,

    /// Comma-separated filesystems to create block StorageClasses for
    #[arg(long, env = "FILESYSTEMS", default_value = "ext4,xfs")]
    filesystems: String,

    /// Default Ceph monitor addresses, comma separated
    #[arg(long, env = "CEPH_MONITORS", default_value = "")]
    ceph_monitors: String,

    /// Default Ceph admin user id
    #[arg(long, env = "CEPH_ADMIN_ID", default_value = "admin")]
    ceph_admin_id: String,

    /// Default Ceph admin keyring
    #[arg(long, env = "CEPH_ADMIN_KEY", default_value = "")]
    ceph_admin_key: String,

    /// Default cloud API secret id, base64 encoded
    #[arg(long, env = "CLOUD_SECRET_ID", default_value = "")]
    cloud_secret_id: String,

    /// Default cloud API secret key, base64 encoded
    #[arg(long, env = "CLOUD_SECRET_KEY", default_value = "")]
    cloud_secret_key: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the CsiDeployment CRD manifest and exit
    #[arg(long)]
    dump_crd: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_crd {
        print!("{}", serde_yaml::to_string(&CsiDeployment::crd())?);
        return Ok(());
    }

    init_logging(&args);

    info!("Starting CSI Driver Operator");
    info!("  Version: {}", csi_driver_operator::VERSION);
    info!("  Registry domain: {}", args.registry_domain);
    info!("  Kubelet root dir: {}", args.kubelet_root_dir);

    let config = Arc::new(OperatorConfig {
        kubelet_root_dir: args.kubelet_root_dir.clone(),
        registry_domain: args.registry_domain.clone(),
        filesystems: args
            .filesystems
            .split(',')
            .filter(|fs| !fs.is_empty())
            .map(str::to_string)
            .collect(),
        ceph: CephConfig {
            monitors: args.ceph_monitors.clone(),
            admin_id: args.ceph_admin_id.clone(),
            admin_key: args.ceph_admin_key.clone(),
        },
        cloud: CloudConfig {
            secret_id: args.cloud_secret_id.clone(),
            secret_key: args.cloud_secret_key.clone(),
        },
    });

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = kube::Client::try_default()
        .await
        .context("failed to build kubernetes client")?;

    run_controller(client, config)
        .await
        .context("controller terminated")?;

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().context("invalid health server address")?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("health server error")?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().context("invalid metrics server address")?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("metrics server error")?;

    Ok(())
}
