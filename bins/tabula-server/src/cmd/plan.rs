use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use tabula_api::{BatchHeader, TableSchema};
use tabula_coordination::{CoordinationService, MemoryCoordinationService};
use tabula_engine::TableHelper;
use tabula_storage_memory::MemoryWarehouse;

use crate::config::{PlanArgs, ServerConfig};
use crate::error::ServerError;

/// Map a batch to its desired table and reconcile it against an in-memory
/// warehouse, optionally seeded with the table as it exists today. Prints
/// the resulting definition and the DDL that was needed.
pub async fn run(args: PlanArgs) -> Result<(), ServerError> {
    let config = ServerConfig::load(&args.config.config)?;
    let destination = config.destination(&args.destination)?.clone();
    let header: BatchHeader = read_json(&args.batch)?;
    if !header.exists() {
        return Err(ServerError::Input {
            path: args.batch.display().to_string(),
            detail: "batch has no fields".into(),
        });
    }

    let warehouse = Arc::new(MemoryWarehouse::default());
    if let Some(path) = &args.current {
        let current: TableSchema = read_json(path)?;
        if current.name != header.table_name {
            tracing::warn!(current = %current.name, batch = %header.table_name, "current table and batch name differ");
        }
        warehouse.seed_table(current).await;
    }
    let coordination = Arc::new(MemoryCoordinationService::new(config.instance_id()));
    let helper = TableHelper::new(destination, warehouse.clone(), coordination.clone());

    let desired = helper.map_table_schema(&args.destination, &header)?;
    let result = helper.ensure_table(&args.destination, &desired).await;
    coordination.close().await?;
    let table = result?;

    let report = serde_json::json!({
        "destination": args.destination,
        "desired": desired,
        "table": table,
        "ddl": {
            "create_table": warehouse.create_calls(),
            "patch_table_schema": warehouse.patch_calls(),
            "update_primary_key": warehouse.pk_calls(),
        },
    });
    let rendered = serde_json::to_string_pretty(&report).map_err(|e| ServerError::Input {
        path: args.batch.display().to_string(),
        detail: format!("render report: {e}"),
    })?;
    println!("{rendered}");
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ServerError> {
    let input_err = |detail: String| ServerError::Input {
        path: path.display().to_string(),
        detail,
    };
    let content = std::fs::read_to_string(path).map_err(|e| input_err(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| input_err(e.to_string()))
}
