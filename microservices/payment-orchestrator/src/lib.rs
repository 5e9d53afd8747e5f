//! Payment Orchestrator - marketplace payment collection
//!
//! Collects payment for lab tests, appointments, medicine orders and nursing
//! services over three rails:
//! - Mobile money (M-Pesa STK push)
//! - Card redirect (Pesapal hosted checkout)
//! - Ledger (Stellar payments, optional contract recording)

pub mod api;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod events;
pub mod fx;
pub mod ledger_recorder;
pub mod locks;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod poller;
pub mod rails;
pub mod repository;
pub mod token_cache;

pub use callbacks::{CallbackAck, CallbackReceiver};
pub use config::PaymentConfig;
pub use error::{PaymentError, Result};
pub use model::*;
pub use orchestrator::PaymentOrchestrator;

use crate::fx::CurrencyNormalizer;
use crate::ledger_recorder::{LedgerRecorder, RetryPolicy, SorobanSink};
use crate::metrics::PaymentMetrics;
use crate::poller::StatusPoller;
use crate::rails::{MpesaAdapter, PesapalAdapter, RailRegistry, StellarAdapter};
use crate::repository::{MemoryPaymentStore, PaymentStore, PostgresPaymentStore};
use crate::token_cache::TokenCache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tiba_core::{DependencyStatus, HealthStatus, ReadinessStatus, TibaService};
use tiba_db::DbPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct PaymentService {
    config: PaymentConfig,
    orchestrator: PaymentOrchestrator,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    start_time: Instant,
}

impl PaymentService {
    pub async fn new(config: PaymentConfig) -> Result<Self> {
        let store: Arc<dyn PaymentStore> = match &config.database {
            Some(pool_config) => {
                let store = PostgresPaymentStore::new(DbPool::new(pool_config.clone())?);
                store.ensure_schema().await?;
                info!("Using PostgreSQL payment store");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set, payments are kept in memory only");
                Arc::new(MemoryPaymentStore::new())
            }
        };

        let tokens = Arc::new(TokenCache::new());
        let normalizer = Arc::new(CurrencyNormalizer::from_config(config.fx.clone())?);
        let metrics = Arc::new(PaymentMetrics::new());

        let mut rails = RailRegistry::new();
        if let Some(mpesa) = config.mpesa.clone() {
            let adapter = MpesaAdapter::new(mpesa, tokens.clone(), config.rail_timeout)?;
            rails.register(Arc::new(adapter));
            info!("Mobile money rail enabled");
        }
        if let Some(pesapal) = config.pesapal.clone() {
            let adapter = PesapalAdapter::new(pesapal, tokens.clone(), config.rail_timeout)?;
            rails.register(Arc::new(adapter));
            info!("Card redirect rail enabled");
        }
        if let Some(stellar) = config.stellar.clone() {
            let adapter = StellarAdapter::new(stellar, normalizer.clone(), config.rail_timeout)?;
            rails.register(Arc::new(adapter));
            info!("Ledger rail enabled");
        }
        if rails.is_empty() {
            warn!("No payment rail configured; charges will be rejected");
        }

        let mut orchestrator = PaymentOrchestrator::new(rails, store).with_metrics(metrics.clone());
        let mut workers = Vec::new();

        if let Some(stellar) = &config.stellar {
            if let Some(sink) = SorobanSink::from_config(stellar, config.rail_timeout)? {
                let (recorder, worker) = LedgerRecorder::spawn(
                    Arc::new(sink),
                    normalizer,
                    RetryPolicy::default(),
                    metrics,
                );
                orchestrator =
                    orchestrator.with_ledger_recorder(recorder, config.ledger_mirror_mobile_money);
                workers.push(worker);
                info!(
                    mirror_mobile_money = config.ledger_mirror_mobile_money,
                    "Ledger contract recording enabled"
                );
            }
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            orchestrator,
            shutdown_tx,
            workers: Mutex::new(workers),
            start_time: Instant::now(),
        })
    }

    pub fn orchestrator(&self) -> &PaymentOrchestrator {
        &self.orchestrator
    }
}

#[async_trait::async_trait]
impl TibaService for PaymentService {
    fn service_id(&self) -> &'static str { "payment-orchestrator" }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let started = Instant::now();
        let store_available = self.orchestrator.store().is_healthy().await;
        let store_latency = started.elapsed().as_millis() as u64;

        let mut dependencies: Vec<DependencyStatus> = self
            .orchestrator
            .rails()
            .enabled()
            .into_iter()
            .map(|rail| DependencyStatus {
                name: format!("rail:{rail}"),
                available: true,
                latency_ms: None,
            })
            .collect();
        let any_rail = !dependencies.is_empty();
        dependencies.push(DependencyStatus {
            name: "payment-store".to_string(),
            available: store_available,
            latency_ms: Some(store_latency),
        });

        ReadinessStatus {
            ready: any_rail && store_available,
            dependencies,
        }
    }

    async fn shutdown(&self) -> tiba_core::Result<()> {
        info!("Shutting down Payment Orchestrator");
        self.shutdown_tx.send_replace(true);
        Ok(())
    }

    async fn start(&self) -> tiba_core::Result<()> {
        let poller = StatusPoller::new(
            self.orchestrator.clone(),
            self.config.poll_interval,
            self.config.callback_window,
        );
        self.workers.lock().push(poller.spawn(self.shutdown_tx.subscribe()));

        let http_bind = &self.config.http_bind;
        info!(bind = %http_bind, "Starting Payment Orchestrator HTTP server");

        let app = api::create_router(self.orchestrator.clone());
        let listener = tokio::net::TcpListener::bind(http_bind).await?;
        let mut shutdown = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;

        for worker in self.workers.lock().drain(..) {
            if !worker.is_finished() {
                worker.abort();
            }
        }
        Ok(())
    }
}
