//! Micronets WebSocket Proxy
//!
//! Listens for mTLS WebSocket connections on `<path-prefix><meetup-id>`,
//! pairs the two clients of each meetup and relays frames between them.

use ws_proxy::config::{Config, USAGE};
use ws_proxy::report;
use ws_proxy::tls;
use ws_proxy::ProxyServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print!("{}", USAGE);
        return Ok(());
    }
    let config = Config::from_args(&args, |var| std::env::var(var).ok())?;

    log::info!("Micronets WebSocket proxy starting...");
    log::info!("  Bind:     {}:{}", config.bind_address, config.port);
    log::info!("  Prefix:   {}", config.path_prefix);
    log::info!("  Cert:     {}", config.cert.display());
    if let Some(key) = &config.key {
        log::info!("  Key:      {}", key.display());
    }
    if let Some(ca_cert) = &config.ca_cert {
        log::info!("  CA cert:  {}", ca_cert.display());
    }
    if let Some(ca_dir) = &config.ca_dir {
        log::info!("  CA dir:   {}", ca_dir.display());
    }

    let tls_config = tls::server_config_from_files(
        &config.cert,
        config.key.as_deref(),
        config.ca_cert.as_deref(),
        config.ca_dir.as_deref(),
    )?;

    let server = ProxyServer::bind(
        (config.bind_address.as_str(), config.port),
        tls_config,
        config.proxy_settings(),
    )
    .await?;

    let state = server.state().clone();
    let _reports = report::spawn_periodic_reports(state.clone(), config.report_interval);
    if let Err(e) = report::install_report_signal(state) {
        log::warn!("SIGUSR1 reports unavailable: {}", e);
    }

    tokio::select! {
        _ = server.run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            log::info!("Interrupted, shutting down");
        }
    }

    Ok(())
}
