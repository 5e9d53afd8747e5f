use payment_orchestrator::{PaymentConfig, PaymentService};
use std::sync::Arc;
use tiba_core::{MicroserviceRuntime, Result, TibaError};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = tiba_telemetry::init("payment-orchestrator")
        .map_err(|e| TibaError::Config(e.to_string()))?;

    info!("Starting Payment Orchestrator");

    let config = PaymentConfig::from_env()?;
    let service = Arc::new(PaymentService::new(config).await?);
    MicroserviceRuntime::run(service).await
}
