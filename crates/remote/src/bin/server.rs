//! CAS artifact server binary.
//!
//! Serves a local CAS repository to peers over gRPC, optionally behind TLS
//! (with mutual TLS when `--client-certs` is given). Pushing is disabled
//! unless `--enable-push` is passed. A clean SIGINT shutdown exits zero;
//! invalid TLS arguments and bind failures exit non-zero.

use buildstream_cas::CasCache;
use buildstream_remote::server::create_router;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bst-artifact-server", about = "CAS Artifact Server", version)]
struct Args {
    /// Port number to listen on
    #[arg(short, long)]
    port: u16,

    /// Private server key for TLS (PEM-encoded)
    #[arg(long)]
    server_key: Option<PathBuf>,

    /// Public server certificate for TLS (PEM-encoded)
    #[arg(long)]
    server_cert: Option<PathBuf>,

    /// Public client certificates for TLS (PEM-encoded)
    #[arg(long)]
    client_certs: Option<PathBuf>,

    /// Allow clients to upload blobs and update artifact refs
    #[arg(long, default_value_t = false)]
    enable_push: bool,

    /// Path to the CAS repository to serve
    repo: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(message) = run(args).await {
        eprintln!("ERROR: {message}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), String> {
    let use_tls = args.server_key.is_some();
    if args.server_cert.is_some() != use_tls {
        return Err("--server-key and --server-cert are both required for TLS".into());
    }
    if args.client_certs.is_some() && !use_tls {
        return Err("--client-certs can only be used with --server-key".into());
    }

    let tls = match (&args.server_key, &args.server_cert) {
        (Some(key_path), Some(cert_path)) => {
            let key = std::fs::read(key_path)
                .map_err(|e| format!("failed to read {}: {e}", key_path.display()))?;
            let cert = std::fs::read(cert_path)
                .map_err(|e| format!("failed to read {}: {e}", cert_path.display()))?;
            let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

            if let Some(client_certs) = &args.client_certs {
                let roots = std::fs::read(client_certs)
                    .map_err(|e| format!("failed to read {}: {e}", client_certs.display()))?;
                tls = tls.client_ca_root(Certificate::from_pem(roots));
            }
            Some(tls)
        }
        _ => None,
    };

    let cas = CasCache::new(&args.repo).map_err(|e| e.to_string())?;

    let addr: SocketAddr = format!("[::]:{}", args.port)
        .parse()
        .map_err(|e| format!("invalid port {}: {e}", args.port))?;

    info!(
        repo = %args.repo.display(),
        %addr,
        enable_push = args.enable_push,
        tls = use_tls,
        "Starting artifact server"
    );

    create_router(cas, args.enable_push, tls)
        .map_err(|e| format!("TLS configuration error: {e}"))?
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .map_err(|e| format!("server error: {e}"))?;

    Ok(())
}
