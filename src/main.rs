use connwatch::api::{ApiConfig, ConnwatchApi};
use connwatch::clock::{Clock, SystemClock};
use connwatch::config::{Config, ProberConfig, StorageBackend};
use connwatch::db::SqliteRepository;
use connwatch::events::EventBus;
use connwatch::notifications::WebhookNotifier;
use connwatch::probe::{tls, NoSqlProbe, Prober};
use connwatch::scheduler::ScheduleEngine;
use connwatch::secrets::CredentialCodec;
use connwatch::store::{MemoryRepository, Repository};
use connwatch::tester::ConnectionTester;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("connwatch=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let first = args.next();

    if first.as_deref() == Some("keygen") {
        let path = args
            .next()
            .map(PathBuf::from)
            .unwrap_or_else(|| connwatch::config::SecretsConfig::default().key_file);
        return keygen(&path);
    }

    let config_path = first
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), version = VERSION, "Configuration loaded");

    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let codec = Arc::new(load_codec(&config)?);

    let repository: Arc<dyn Repository> = match config.database.backend {
        StorageBackend::Sqlite => {
            info!(path = %config.database.path.display(), "Using SQLite storage");
            Arc::new(SqliteRepository::open(&config.database.path)?)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; records are lost on exit");
            Arc::new(MemoryRepository::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events = EventBus::default();
    let tester = Arc::new(ConnectionTester::new(
        repository,
        codec,
        build_prober(&config.prober),
        events.clone(),
        clock.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut notifier_handles = Vec::new();
    for webhook in config.notifications.webhooks.iter().cloned() {
        notifier_handles.push(WebhookNotifier::new(webhook).spawn(&events, shutdown_rx.clone()));
    }

    let engine = Arc::new(ScheduleEngine::new(
        tester.clone(),
        clock,
        config.scheduler.clone(),
    ));

    let scheduler_handle = if config.scheduler.enabled {
        let engine = engine.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { engine.run(rx).await }))
    } else {
        info!("Scheduler disabled; schedules run only on demand");
        None
    };

    let auth_token = config.server.api_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated API token (configure server.api_token to set a fixed value)");
        token
    });

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let api = Arc::new(ConnwatchApi::new(
        ApiConfig {
            bind_addr,
            auth_token,
            max_body_bytes: config.server.max_body_bytes,
            prober: config.prober.clone(),
        },
        tester,
        engine.clone(),
        shutdown_rx.clone(),
    ));

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "API server error");
        }
    });

    wait_for_signal().await;

    let _ = shutdown_tx.send(true);

    // The scheduler waits out its own grace period; allow a little on top
    let deadline = config.scheduler.shutdown_grace() + Duration::from_secs(5);
    let stopped = tokio::time::timeout(deadline, async {
        if let Some(handle) = scheduler_handle {
            let _ = handle.await;
        } else {
            engine.shutdown(config.scheduler.shutdown_grace()).await;
        }
        let _ = api_handle.await;
        for handle in notifier_handles {
            let _ = handle.await;
        }
    })
    .await;

    if stopped.is_err() {
        warn!("Shutdown deadline passed with tasks still running");
    }

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Environment key first, then the key file, else a fresh key saved to the file
fn load_codec(config: &Config) -> anyhow::Result<CredentialCodec> {
    if std::env::var_os(&config.secrets.key_env).is_some() {
        let codec = CredentialCodec::from_env(&config.secrets.key_env)?;
        info!(var = %config.secrets.key_env, key_id = codec.current_key_id(), "Credential key loaded from environment");
        return Ok(codec);
    }

    let path = &config.secrets.key_file;
    if path.exists() {
        return CredentialCodec::load_from_file(path);
    }

    warn!(path = %path.display(), "No credential key found, generating a new one");
    let codec = CredentialCodec::new();
    codec.save_to_file(path)?;
    Ok(codec)
}

fn keygen(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        let mut codec = CredentialCodec::load_from_file(path)?;
        let previous = codec.current_key_id().to_string();
        codec.rotate_key();
        codec.save_to_file(path)?;
        println!("Rotated key {} -> {} in {}", previous, codec.current_key_id(), path.display());
    } else {
        let codec = CredentialCodec::new();
        codec.save_to_file(path)?;
        println!("Generated key {} in {}", codec.current_key_id(), path.display());
    }
    Ok(())
}

/// Prober whose NoSQL strategy trusts the configured CA bundle
fn build_prober(config: &ProberConfig) -> Prober {
    let prober = Prober::new(config.timeout());
    let Some(bundle) = &config.ca_bundle else {
        return prober;
    };

    match tls::load_roots(bundle).and_then(tls::connector) {
        Ok(connector) => prober.with_strategy(Arc::new(NoSqlProbe::new(Some(connector)))),
        Err(e) => {
            warn!(error = %e, "TLS for NoSQL probes disabled");
            prober
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another connwatch instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Only truncate once the lock is ours
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}
