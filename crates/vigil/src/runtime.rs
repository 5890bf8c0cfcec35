use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use vigil_core::channel::ChannelType;
use vigil_core::clock::{SharedClock, SystemClock};
use vigil_core::metrics::{HttpMetricsProvider, MetricsProvider};
use vigil_core::rate_limit::RateLimitConfig;
use vigil_core::{Result, VigilConfig, VigilError};

use vigil_runtime::audit::AuditLedger;
use vigil_runtime::cache::StateCache;
use vigil_runtime::channels::{EmailChannel, SmsChannel, WebhookChannel};
use vigil_runtime::db::Database;
use vigil_runtime::dispatch::{ChannelRegistry, Dispatcher};
use vigil_runtime::engine::{QueueSink, RulesEngine};
use vigil_runtime::gateway::{ApiState, AuthMiddleware, GatewayServer, RateLimiter};
use vigil_runtime::migrations::MigrationRunner;
use vigil_runtime::store::{AlertStore, ChannelStore, NotificationStore, RuleStore};

/// The assembled alert manager runtime.
pub struct Vigil {
    config: Option<VigilConfig>,
    clock: SharedClock,
    provider: Option<Arc<dyn MetricsProvider>>,
}

impl Vigil {
    /// Create a new builder.
    pub fn builder() -> VigilBuilder {
        VigilBuilder::new()
    }

    fn config(&self) -> Result<&VigilConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| VigilError::Config("Configuration is required".to_string()))
    }

    /// Apply pending migrations and exit.
    pub async fn migrate(self) -> Result<()> {
        let config = self.config()?;
        if config.database.url.is_empty() {
            return Err(VigilError::Config("database.url is required".to_string()));
        }

        let db = Database::from_config(&config.database).await?;
        MigrationRunner::new(db.pool().clone()).run().await?;
        db.close().await;

        tracing::info!("Migrations applied");
        Ok(())
    }

    /// Verify the audit chain over a range and print the report.
    pub async fn verify(
        self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let config = self.config()?;
        if config.database.url.is_empty() {
            return Err(VigilError::Config("database.url is required".to_string()));
        }

        let db = Database::from_config(&config.database).await?;
        let ledger = AuditLedger::new(db.pool().clone(), self.clock.clone());

        let report = ledger.verify_chain(start, end).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);

        db.close().await;
        Ok(())
    }

    /// Run the full service until interrupted.
    pub async fn run(self) -> Result<()> {
        let config = self.config()?.clone();
        config.validate()?;

        let metrics_provider = match &self.provider {
            Some(provider) => provider.clone(),
            None => {
                if config.metrics.url.is_empty() {
                    return Err(VigilError::Config("metrics.url is required".to_string()));
                }
                Arc::new(HttpMetricsProvider::new(
                    &config.metrics.url,
                    reqwest::Client::new(),
                )) as Arc<dyn MetricsProvider>
            }
        };

        tracing::info!("VIGIL starting");

        // Database and schema
        let db = Database::from_config(&config.database).await?;
        MigrationRunner::new(db.pool().clone()).run().await?;
        tracing::info!("Connected to database, migrations applied");

        let pool = db.pool().clone();
        let rule_store = RuleStore::new(pool.clone());
        let alert_store = AlertStore::new(pool.clone());
        let channel_store = ChannelStore::new(pool.clone());
        let notification_store = NotificationStore::new(pool.clone());
        let cache = Arc::new(StateCache::with_max_entries(config.cache.max_entries));
        let ledger = Arc::new(AuditLedger::new(pool.clone(), self.clock.clone()));

        // Channel implementations
        let registry = Arc::new(build_registry(&config));

        let dispatcher = Arc::new(Dispatcher::new(
            config.notify.clone(),
            rule_store.clone(),
            channel_store.clone(),
            notification_store.clone(),
            registry.clone(),
            self.clock.clone(),
        ));

        // Engine, wired to the dispatcher through a queue sink
        let engine = RulesEngine::new(
            config.engine.clone(),
            rule_store.clone(),
            alert_store.clone(),
            metrics_provider,
            self.clock.clone(),
            cache,
        );

        let (sink, mut events) = QueueSink::channel();
        engine.register_handler(Arc::new(sink));

        let cancel = CancellationToken::new();

        {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Some(event) => dispatcher.handle_event(event).await,
                            None => break,
                        },
                    }
                }
            });
        }

        engine.start()?;

        // Retention sweeper
        {
            let ledger = ledger.clone();
            let alert_store = alert_store.clone();
            let clock = self.clock.clone();
            let retention = config.retention.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(retention.sweep_interval_secs));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let now = clock.now();
                    let audit_cutoff =
                        now - chrono::Duration::days(retention.audit_archive_days as i64);
                    if let Err(e) = ledger.archive(audit_cutoff).await {
                        tracing::error!("Audit archival failed: {}", e);
                    }

                    let alert_cutoff =
                        now - chrono::Duration::days(retention.alert_retention_days as i64);
                    match alert_store.prune_resolved(alert_cutoff).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(pruned = n, "Pruned resolved alerts"),
                        Err(e) => tracing::error!("Alert pruning failed: {}", e),
                    }
                }
            });
        }

        // HTTP API
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::per_minute(config.auth.read_requests_per_minute),
            RateLimitConfig::per_minute(config.auth.write_requests_per_minute),
            self.clock.clone(),
        ));

        {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let cleanup = Duration::from_secs(config.auth.bucket_cleanup_interval_secs);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cleanup);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    limiter.cleanup(cleanup * 2);
                }
            });
        }

        let auth = Arc::new(AuthMiddleware::new(&config.auth.jwt_secret));
        let state = ApiState {
            rule_store,
            channel_store,
            alert_store,
            ledger,
            dispatcher: dispatcher.clone(),
            engine: engine.clone(),
            db: db.clone(),
            clock: self.clock.clone(),
        };

        let gateway = GatewayServer::new(config.http.clone(), auth, limiter, state);
        let server = tokio::spawn(gateway.run(cancel.clone()));

        tracing::info!("VIGIL started");

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| VigilError::Internal(format!("signal handler failed: {}", e)))?;
        tracing::info!("Received shutdown signal");

        // Graceful shutdown: stop evaluation, cancel pending retries, drain.
        cancel.cancel();
        engine.stop().await;
        dispatcher.cancel();

        if let Ok(Err(e)) = server.await {
            tracing::warn!("HTTP server error during shutdown: {}", e);
        }

        db.close().await;
        tracing::info!("VIGIL stopped");
        Ok(())
    }
}

/// Register channel implementations for every type the config supports.
fn build_registry(config: &VigilConfig) -> ChannelRegistry {
    let registry = ChannelRegistry::new();
    let client = reqwest::Client::new();

    registry.register(
        ChannelType::Webhook,
        Arc::new(WebhookChannel::new(client.clone(), config.webhook.clone())),
    );
    registry.register(
        ChannelType::Slack,
        Arc::new(WebhookChannel::for_type(
            client.clone(),
            config.webhook.clone(),
            ChannelType::Slack,
        )),
    );
    registry.register(
        ChannelType::Discord,
        Arc::new(WebhookChannel::for_type(
            client.clone(),
            config.webhook.clone(),
            ChannelType::Discord,
        )),
    );

    if config.smtp.host.is_empty() {
        tracing::warn!("SMTP not configured; email channels are disabled");
    } else {
        match EmailChannel::from_config(&config.smtp) {
            Ok(email) => registry.register(ChannelType::Email, Arc::new(email)),
            Err(e) => tracing::error!("Email channel disabled: {}", e),
        }
    }

    match SmsChannel::new(client, config.sms.clone()) {
        Ok(sms) => registry.register(ChannelType::Sms, Arc::new(sms)),
        Err(e) => tracing::warn!("SMS channels are disabled: {}", e),
    }

    registry
}

/// Builder for the VIGIL runtime.
pub struct VigilBuilder {
    config: Option<VigilConfig>,
    clock: Option<SharedClock>,
    provider: Option<Arc<dyn MetricsProvider>>,
}

impl VigilBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            clock: None,
            provider: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: VigilConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the clock (tests).
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the metrics provider (tests, embedded deployments).
    pub fn metrics_provider(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Vigil {
        Vigil {
            config: self.config,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            provider: self.provider,
        }
    }
}

impl Default for VigilBuilder {
    fn default() -> Self {
        Self::new()
    }
}
