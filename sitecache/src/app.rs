//! Client context and initialization
//!
//! This module owns the client lifecycle. All services are built here and
//! shared through `ClientContext`.

use crate::backend::BackendClient;
use crate::config::DATABASE_FILE;
use crate::error::{AppError, Result};
use crate::realtime::{
    project_activity_channel, task_board_channel, PhoenixTransport, QueryCache, RealtimeListener,
    RealtimeTransport, Topic,
};
use crate::scope::ViewScope;
use crate::services::{
    ClientSettings, ConnectivityEvent, ConnectivityMonitor, LimitGate, NotificationCenter,
    RefreshFrequency, RefreshScheduler, SyncService, WeatherService,
};
use crate::storage::{OfflineStore, SqliteStorage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Central client state holding all services
pub struct ClientContext {
    pub app_data_dir: PathBuf,
    pub settings: ClientSettings,
    pub store: Arc<OfflineStore>,
    pub connectivity: ConnectivityMonitor,
    pub notifications: Arc<NotificationCenter>,
    pub backend: BackendClient,
    pub weather: Arc<WeatherService>,
    pub limits: LimitGate,
    pub sync: Arc<SyncService>,
    pub queries: Arc<QueryCache>,
    storage: SqliteStorage,
    scheduler: RefreshScheduler,
    realtime: RwLock<Option<Arc<dyn RealtimeTransport>>>,
    background: CancellationToken,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientContext {
    /// Client setup - called once on startup
    pub async fn init(
        app_data_dir: &Path,
        settings: ClientSettings,
        initially_online: bool,
    ) -> Result<Self> {
        tracing::info!("Initializing client");
        tracing::info!("App data directory: {:?}", app_data_dir);

        tokio::fs::create_dir_all(app_data_dir).await?;

        let storage = SqliteStorage::open(&app_data_dir.join(DATABASE_FILE)).await?;
        let store = Arc::new(OfflineStore::init(Arc::new(storage.clone())).await);

        let connectivity = ConnectivityMonitor::new(initially_online);
        let notifications = Arc::new(NotificationCenter::new());
        let backend = BackendClient::new(&settings.backend.url, settings.backend.anon_key.clone())?;

        let weather = Arc::new(
            WeatherService::new(Arc::new(backend.clone()), connectivity.clone())
                .with_retry_policy(settings.retry.policy())
                .with_windows(settings.weather.freshness(), settings.weather.retention()),
        );
        let limits = LimitGate::new(
            Arc::new(backend.clone()),
            notifications.clone(),
            connectivity.clone(),
        );
        let sync = Arc::new(SyncService::new(
            store.clone(),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            connectivity.clone(),
            notifications.clone(),
        ));

        let frequency: RefreshFrequency = settings
            .weather
            .refresh_frequency
            .parse()
            .map_err(AppError::InvalidInput)?;
        let scheduler = RefreshScheduler::new().await?;
        scheduler
            .schedule_weather_refresh(weather.clone(), frequency)
            .await?;
        scheduler.start().await?;

        let background = CancellationToken::new();
        let reconnect_task = sync.clone().spawn_on_reconnect(background.child_token());

        tracing::info!("Client initialized successfully");

        Ok(Self {
            app_data_dir: app_data_dir.to_path_buf(),
            settings,
            store,
            connectivity,
            notifications,
            backend,
            weather,
            limits,
            sync,
            queries: Arc::new(QueryCache::new()),
            storage,
            scheduler,
            realtime: RwLock::new(None),
            background,
            reconnect_task: Mutex::new(Some(reconnect_task)),
        })
    }

    /// Feed a platform connectivity signal into the monitor
    pub fn report_connectivity(&self, online: bool) -> Option<ConnectivityEvent> {
        self.connectivity.report(online)
    }

    /// Connect the realtime socket of the hosted backend
    pub async fn connect_realtime(&self) -> Result<()> {
        if !self.settings.backend.realtime_enabled {
            return Err(AppError::Realtime("realtime is disabled in settings".to_string()));
        }
        let url = self.backend.realtime_url()?;
        let transport = PhoenixTransport::connect(url, self.backend.access_token().await).await?;
        self.use_realtime_transport(Arc::new(transport)).await;
        Ok(())
    }

    /// Route live listeners through `transport`
    pub async fn use_realtime_transport(&self, transport: Arc<dyn RealtimeTransport>) {
        *self.realtime.write().await = Some(transport);
    }

    pub async fn open_project_activity(
        &self,
        project_id: &str,
        scope: &ViewScope,
    ) -> Result<RealtimeListener> {
        self.open_topic(project_activity_channel(project_id), scope)
            .await
    }

    pub async fn open_task_board(
        &self,
        project_id: &str,
        scope: &ViewScope,
    ) -> Result<RealtimeListener> {
        self.open_topic(task_board_channel(project_id), scope).await
    }

    async fn open_topic(&self, topic: Topic, scope: &ViewScope) -> Result<RealtimeListener> {
        let transport = self
            .realtime
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::Realtime("realtime is not connected".to_string()))?;

        RealtimeListener::open(
            transport,
            topic.spec,
            topic.bindings,
            self.queries.clone(),
            scope,
            self.notifications.clone(),
        )
        .await
    }

    /// Stop background work, flush the store and close the database
    pub async fn teardown(&self) {
        tracing::info!("Tearing down client");

        self.background.cancel();
        if let Some(task) = self.reconnect_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("Reconnect task failed: {}", e);
            }
        }

        if let Err(e) = self.scheduler.shutdown().await {
            tracing::error!("Failed to shut down scheduler: {}", e);
        }

        self.realtime.write().await.take();
        self.store.teardown().await;
        self.storage.repository().close().await;

        tracing::info!("Client teardown complete");
    }
}
