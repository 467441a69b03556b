use anyhow::{Context, Result};
use rollcall_core::{
    AttendanceLedger, ClassroomRegistry, Collaborators, DirectoryService, FrameSource,
};
use rollcall_hw::{backend_for, CaptureController};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod services;
mod store;

use config::{BusKind, Config, LedgerBackend};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

/// The registry, directory and ledger roles, all served by one backend.
struct Backends {
    registry: Arc<dyn ClassroomRegistry>,
    directory: Arc<dyn DirectoryService>,
    ledger: Arc<dyn AttendanceLedger>,
}

impl Backends {
    fn shared<T>(backend: Arc<T>) -> Self
    where
        T: ClassroomRegistry + DirectoryService + AttendanceLedger + 'static,
    {
        Self {
            registry: backend.clone(),
            directory: backend.clone(),
            ledger: backend,
        }
    }
}

async fn open_backends(config: &Config) -> Result<Backends> {
    match config.ledger_backend {
        LedgerBackend::Sqlite => {
            let store = store::SqliteLedger::open(&config.db_path)
                .await
                .with_context(|| format!("failed to open ledger at {}", config.db_path.display()))?;
            tracing::info!(path = %config.db_path.display(), "using local SQLite ledger");
            Ok(Backends::shared(Arc::new(store)))
        }
        LedgerBackend::Http => {
            let client = services::LedgerGatewayClient::new(&config.ledger_url, config.timeouts().ledger)
                .context("failed to create ledger gateway client")?;
            tracing::info!(url = %config.ledger_url, "using remote ledger gateway");
            Ok(Backends::shared(Arc::new(client)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    let timeouts = config.timeouts();
    tracing::info!(
        camera = %config.camera_device,
        resolver = %config.resolver_url,
        ledger = ?config.ledger_backend,
        "configuration loaded"
    );

    let backends = open_backends(&config).await?;
    let resolver = services::HttpResolver::new(&config.resolver_url, timeouts.resolver)
        .context("failed to create resolver client")?;
    let collaborators = Collaborators {
        resolver: Arc::new(resolver),
        directory: backends.directory,
        ledger: backends.ledger,
    };

    // The camera is opened lazily by StartSession.
    let controller = CaptureController::new(
        backend_for(&config.camera_device),
        config.camera_device.clone(),
        config.still,
        config.warmup_frames,
    );
    let engine = engine::spawn_engine(controller).context("failed to start capture engine")?;
    let camera: Arc<dyn FrameSource> = Arc::new(engine);

    let service = AttendanceService::new(
        camera,
        config.camera_device.clone(),
        backends.registry,
        collaborators,
        timeouts,
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let iface = connection
        .object_server()
        .interface::<_, AttendanceService>(OBJECT_PATH)
        .await?;
    iface.get().await.shutdown().await;

    Ok(())
}
