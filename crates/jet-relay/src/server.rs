//! Relay server: wires listeners, registry and the management API together

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use jet_token::TokenValidator;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::association::AssociationRegistry;
use crate::auth::TokenAuthority;
use crate::config::{ListenerScheme, ListenerUrl, ServerConfig};
use crate::forwarder::Forwarder;
use crate::jrl::JrlStore;
use crate::listener::{self, RelayContext};
use crate::metrics::RelayMetrics;
use crate::session::SessionManager;
use crate::tls::{self, TlsIdentity};

/// How often bandwidth gauges are refreshed
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

pub struct RelayServer {
    config: Arc<ServerConfig>,
    listeners: Vec<ListenerUrl>,
    tls: Option<TlsIdentity>,
    metrics: Arc<RelayMetrics>,
    relay: RelayContext,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let listeners = config.listener_urls()?;
        let metrics = Arc::new(RelayMetrics::new().context("Failed to register metrics")?);

        let validator = TokenValidator::new(config.key_store()?, config.validator_config());
        let jrl = Arc::new(
            JrlStore::load(&config.jrl_file)
                .with_context(|| format!("Failed to load revocation list {:?}", config.jrl_file))?,
        );
        let authority = TokenAuthority::new(validator, jrl, Arc::clone(&metrics));

        let forwarder = Forwarder::new(config.recording_dir.clone(), Arc::clone(&metrics));
        let sessions = SessionManager::new(config.session_history);
        let registry = Arc::new(AssociationRegistry::new(
            config.negotiation_config(),
            forwarder,
            sessions,
            Arc::clone(&metrics),
        ));

        let tls = if listeners.iter().any(|url| url.scheme == ListenerScheme::Tls) {
            match (&config.tls_cert_path, &config.tls_key_path) {
                (Some(cert), Some(key)) => Some(TlsIdentity::load(cert, key)?),
                _ => anyhow::bail!("tls listeners require tls_cert_path and tls_key_path"),
            }
        } else {
            None
        };

        if config.unsafe_allow_unsigned_tokens {
            warn!("Unsigned tokens are accepted; never use this outside of testing");
        }

        Ok(Self {
            config: Arc::new(config),
            listeners,
            tls,
            metrics,
            relay: RelayContext { authority, registry },
        })
    }

    /// Run until SIGINT or SIGTERM, then drain
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for url in &self.listeners {
            let socket = TcpListener::bind(url.addr)
                .await
                .with_context(|| format!("Failed to bind relay listener {url}"))?;
            tokio::spawn(listener::serve(
                socket,
                url.clone(),
                self.tls.clone(),
                self.relay.clone(),
                shutdown_rx.clone(),
            ));
        }

        if let Some(identity) = &self.tls {
            tls::spawn_reload_on_sighup(identity.clone());
        }

        let metrics = Arc::clone(&self.metrics);
        let mut metrics_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => metrics.update_rate_calc(),
                    _ = metrics_shutdown.changed() => break,
                }
            }
        });

        let app = api::router(AppState {
            relay: self.relay.clone(),
            config: Arc::clone(&self.config),
            listeners: Arc::new(self.listeners.clone()),
            metrics: Arc::clone(&self.metrics),
            http_client: reqwest::Client::new(),
        });
        let http = TcpListener::bind(self.config.http_listener)
            .await
            .with_context(|| format!("Failed to bind HTTP listener {}", self.config.http_listener))?;
        info!(
            id = %self.config.instance_id(),
            http = %self.config.http_listener,
            listeners = self.listeners.len(),
            "JET relay started"
        );

        let server = axum::serve(http, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
        let mut http_task = tokio::spawn(async move { server.await });

        tokio::select! {
            _ = shutdown_signal() => {}
            result = &mut http_task => {
                // the HTTP server only returns early on failure
                let _ = shutdown_tx.send(true);
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e).context("HTTP server failed"),
                    Err(e) => Err(e).context("HTTP server task panicked"),
                };
            }
        }

        let _ = shutdown_tx.send(true);
        self.drain().await;

        match tokio::time::timeout(self.config.shutdown_timeout(), http_task).await {
            Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error during shutdown"),
            Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
            Err(_) => warn!("HTTP server did not stop in time"),
            Ok(Ok(Ok(()))) => {}
        }

        info!("JET relay stopped");
        Ok(())
    }

    /// Terminate every association and wait for them to close
    async fn drain(&self) {
        let registry = &self.relay.registry;
        info!(associations = registry.count(), "Terminating associations");
        registry.terminate_all();

        let deadline = Instant::now() + self.config.shutdown_timeout();
        while registry.count() > 0 {
            if Instant::now() >= deadline {
                warn!(remaining = registry.count(), "Shutdown timeout reached with associations still open");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("All associations closed");
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let mut sigterm = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).ok()
    };

    tokio::select! {
        _ = async {
            #[cfg(unix)]
            {
                if let Some(ref mut sigterm) = sigterm {
                    sigterm.recv().await;
                    return;
                }
            }
            std::future::pending::<()>().await;
        } => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, starting graceful shutdown");
        }
    }
}
