use crate::bus::MessageBus;
use crate::config::Config;
use crate::ingest::IngestListener;
use crate::management::ManagementSocket;
use crate::rtpr::RtprSessionAggregator;
use crate::sip::{CallAggregator, SipMessageHandler, TransactionAggregator, SINGLE_SHARD_PREFIXES};
use crate::storage::StorageManager;
use crate::udf::UdfDispatcher;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct App {
    pub config: Arc<Config>,
    pub bus: Arc<MessageBus>,
    cancel_token: CancellationToken,
}

pub struct AppBuilder {
    config: Option<Config>,
    cancel_token: Option<CancellationToken>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cancel_token: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn build(self) -> Result<App> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok(App {
            config: Arc::new(config),
            bus: Arc::new(MessageBus::new()),
            cancel_token: self.cancel_token.unwrap_or_default(),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Wire every worker onto the bus and run until cancelled. Aggregators
    /// subscribe before the message handler starts forwarding, and call
    /// aggregator shards subscribe in shard order so sharded sends stay
    /// aligned with the Call-ID routing.
    pub async fn run(self) -> Result<()> {
        crate::observability::install_recorder()?;
        crate::metrics::init_static_gauges();

        let config = self.config.clone();
        let bus = self.bus.clone();
        let cancel_token = self.cancel_token.clone();

        let storage = StorageManager::new(&config.storage, CancellationToken::new())?;
        let udf = UdfDispatcher::new(
            bus.clone(),
            Duration::from_millis(config.udf.execution_timeout_ms),
        );
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.push(udf.spawn_refresh(
            Duration::from_millis(config.udf.check_period_ms),
            cancel_token.child_token(),
        ));

        for shard in 0..config.instances {
            for prefix in ["sip_call", "sip_register"] {
                handles.push(
                    TransactionAggregator::new(
                        prefix,
                        shard,
                        bus.clone(),
                        storage.sender(),
                        udf.clone(),
                        config.sip.transaction.clone(),
                        config.time_suffix.clone(),
                    )
                    .spawn(cancel_token.child_token()),
                );
            }
        }
        for prefix in SINGLE_SHARD_PREFIXES {
            handles.push(
                TransactionAggregator::new(
                    prefix,
                    0,
                    bus.clone(),
                    storage.sender(),
                    udf.clone(),
                    config.sip.transaction.clone(),
                    config.time_suffix.clone(),
                )
                .spawn(cancel_token.child_token()),
            );
        }
        for shard in 0..config.instances {
            handles.push(
                CallAggregator::new(
                    shard,
                    bus.clone(),
                    storage.sender(),
                    udf.clone(),
                    config.sip.call.clone(),
                    config.time_suffix.clone(),
                )
                .spawn(cancel_token.child_token()),
            );
        }

        handles.push(
            SipMessageHandler::new(
                bus.clone(),
                storage.sender(),
                &config.sip.message.exclusions,
                config.instances,
                config.time_suffix.clone(),
            )
            .spawn(cancel_token.child_token()),
        );
        handles.push(
            RtprSessionAggregator::new(
                bus.clone(),
                storage.sender(),
                config.media.rtpr.clone(),
                config.time_suffix.clone(),
            )
            .spawn(cancel_token.child_token()),
        );

        let (management_addr, management_handle) = ManagementSocket::spawn(
            bus.clone(),
            storage.sender(),
            config.management.clone(),
            cancel_token.child_token(),
        )
        .await?;
        info!(%management_addr, "management socket ready");
        handles.push(management_handle);

        if let Some(ref ingest) = config.ingest {
            handles.push(
                IngestListener::spawn(bus.clone(), &ingest.addr, cancel_token.child_token())
                    .await?,
            );
        }

        if let Some(router) = crate::observability::router(&config.metrics) {
            let listener = TcpListener::bind(&config.http_addr)
                .await
                .map_err(|e| anyhow!("failed to bind http on {}: {}", config.http_addr, e))?;
            info!("http listening on {}", listener.local_addr()?);
            let shutdown = cancel_token.clone().cancelled_owned();
            handles.push(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    tracing::error!("http server error: {}", e);
                }
            }));
        }

        info!(
            instances = config.instances,
            "voipmon core started"
        );
        cancel_token.cancelled().await;

        for handle in handles {
            handle.await.ok();
        }
        storage.flush().await;
        storage.stop();
        info!("stopped");
        Ok(())
    }
}
