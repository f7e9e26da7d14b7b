use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ftpd::cli::DaemonOpts;
use ftpd::config::ServerConfig;
use ftpd::context::Services;
use ftpd::server::FtpServer;
use ftpd::tls;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(opts.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let mut config = match &opts.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    opts.apply(&mut config);
    config.validate()?;

    if !config.root.is_dir() {
        anyhow::bail!("Root directory does not exist: {}", config.root.display());
    }

    let identity = if config.tls.wanted() {
        match &config.tls.cert {
            Some(cert) => info!("using certificate {}", cert.display()),
            None => info!("using self-signed certificate in {}", tls::config_dir().display()),
        }
        let identity = tls::load_or_generate_server_config(config.tls.cert.clone(), config.tls.key.clone())
            .context("Failed to set up TLS configuration")?;
        info!(fingerprint = %identity.fingerprint(), "TLS ready");
        Some(identity)
    } else {
        None
    };

    if config.anonymous && (config.listen == "*" || config.listen.starts_with("0.0.0.0")) {
        warn!("anonymous access is enabled on all interfaces");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let services = Services::from_config(config, identity)?;
        info!(root = %services.config.root.display(), "starting ftpd");
        let server = FtpServer::bind(services).await?;
        server.start();

        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r.context("listen for ctrl-c")?;
                info!("shutting down");
            }
            _ = server.stopped() => {}
        }
        server.shutdown().await;
        Ok::<_, anyhow::Error>(())
    })
}
