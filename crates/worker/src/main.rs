use std::sync::Arc;

use anyhow::{Context, Result};
use keelrun_durable::prelude::*;
use keelrun_worker::{
    init_telemetry, register_activities, ChargePayment, OrderInput, OrderWorkflow,
    TelemetryConfig, WorkerConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Keep the guard alive for the lifetime of the application
    let _telemetry_guard = init_telemetry(TelemetryConfig::from_env());

    let config = WorkerConfig::from_env();
    tracing::info!(
        worker_id = %config.worker_id,
        task_queue = %config.task_queue,
        max_concurrent = config.max_concurrent_activities,
        "keelrun-worker starting..."
    );

    let store: Arc<dyn WorkflowEventStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresWorkflowEventStore::connect(url)
                .await
                .context("Failed to connect to database")?;
            store.migrate().await.context("Failed to run migrations")?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, history is kept in memory only");
            Arc::new(InMemoryWorkflowEventStore::new())
        }
    };

    let registry = Arc::new(WorkflowRegistry::new().with::<OrderWorkflow>());
    let runtime = Arc::new(DurableRuntime::new(store, registry, config.runtime_config()));
    runtime.start();
    runtime.recover().await.context("Failed to recover open runs")?;
    runtime.serve_workflows(&config.task_queue);

    let pool = runtime.worker_pool(config.pool_config());
    register_activities(
        &pool,
        ChargePayment {
            failure_rate: config.charge_failure_rate,
            ..Default::default()
        },
    );
    pool.start().context("Failed to start worker pool")?;

    if config.start_demo_order {
        let order = OrderInput {
            order_id: format!("demo-{}", uuid::Uuid::now_v7()),
            sku: "sku-demo".to_string(),
            quantity: 1,
            amount_cents: 1_999,
        };
        let started = runtime
            .start_workflow(StartWorkflowRequest::new(
                order.order_id.clone(),
                config.task_queue.clone(),
                <OrderWorkflow as Workflow>::TYPE,
                serde_json::to_value(&order)?,
            ))
            .await
            .context("Failed to start demo order")?;
        tracing::info!(workflow_id = %started.workflow_id, run_id = %started.run_id, "Started demo order");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    if let Err(e) = pool.shutdown().await {
        tracing::error!(error = %e, "Worker pool did not drain");
    }
    runtime.shutdown().await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
