mod config;
mod interceptors;
mod messages;
mod services;

use anyhow::Context;
use clap::Parser;
use config::ServerConfig;
use interceptors::cert;
use joblib::executor::JobExecutor;
use joblib::socket::DatagramListener;
use joblib::store::JsonFileStore;
use joblib::{JobService, UsageAccountant};
use messages::LogHandler;
use protobuf::remote_jobs_server::RemoteJobsServer;
use services::jobservice::{Authorizer, RemoteJobsService};
use std::sync::Arc;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// requests queued on the accountant before callers wait for room
const ACCOUNTANT_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::parse();
    serve(config).await
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let addr = config
        .listen
        .parse()
        .with_context(|| format!("bad listen address {}", config.listen))?;

    // load server identity
    let cert = tokio::fs::read(&config.tls_cert)
        .await
        .with_context(|| format!("failed to read {}", config.tls_cert.display()))?;
    let key = tokio::fs::read(&config.tls_key)
        .await
        .with_context(|| format!("failed to read {}", config.tls_key.display()))?;
    let server_identity = Identity::from_pem(cert, key);

    // load CA cert
    let ca_cert = tokio::fs::read(&config.tls_ca)
        .await
        .with_context(|| format!("failed to read {}", config.tls_ca.display()))?;
    let ca_cert = Certificate::from_pem(ca_cert);

    let tls_config = ServerTlsConfig::new()
        .identity(server_identity)
        .client_ca_root(ca_cert);

    let store = JsonFileStore::new(&config.stats_file);
    let stats = store
        .load()
        .await
        .with_context(|| format!("failed to load {}", config.stats_file.display()))?;
    info!(callers = stats.len(), path = %config.stats_file.display(), "usage stats loaded");
    let accountant = UsageAccountant::spawn(stats, Arc::new(store), ACCOUNTANT_CAPACITY);
    let policy = config.delivery();
    let jobs = JobService::new(JobExecutor::new(config.executor()), accountant, policy);

    #[cfg(unix)]
    {
        let server = joblib::socket::MessageServer::bind(&config.socket)
            .with_context(|| format!("failed to bind {}", config.socket.display()))?;
        info!(path = %server.path().display(), "listening for framed messages");
        tokio::spawn(server.serve(Arc::new(LogHandler::new("socket"))));
    }
    let datagrams = DatagramListener::bind(config.datagram.as_str())
        .await
        .with_context(|| format!("failed to bind {}", config.datagram))?;
    info!(addr = %datagrams.local_addr()?, "listening for datagrams");
    tokio::spawn(datagrams.serve(Arc::new(LogHandler::new("datagram"))));

    let job_service = RemoteJobsService::new(
        jobs,
        Authorizer::new(config.admin.clone()),
        config.response_capacity,
        policy.deadline,
    );
    let remote_jobs_server =
        RemoteJobsServer::with_interceptor(job_service, cert::extract_caller_id);
    info!(%addr, pid = std::process::id(), "server started");

    Server::builder()
        .tls_config(tls_config)?
        .add_service(remote_jobs_server)
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    #[cfg(unix)]
    if let Err(err) = std::fs::remove_file(&config.socket) {
        warn!(%err, path = %config.socket.display(), "failed to remove socket");
    }
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "unable to listen for shutdown signal");
        futures::future::pending::<()>().await;
    }
    info!("shutting down");
}
