//! One-shot commands against the coordination backend.
//!
//! They register under a throwaway instance id, so closing afterwards never
//! removes the heartbeat of a server sharing the config file. The memory
//! backend lives inside this one process and is rejected.

use std::sync::Arc;

use tabula_coordination::{CoordinationConfig, CoordinationService, InstanceId};

use crate::config::{ConfigArgs, KeyArgs, ServerConfig, VersionArgs};
use crate::error::ServerError;

async fn connect(args: &ConfigArgs) -> Result<Arc<dyn CoordinationService>, ServerError> {
    let config = ServerConfig::load(&args.config)?;
    let coordination = shared_backend(&config)?;
    Ok(tabula_coordination::connect(coordination, InstanceId::random()).await?)
}

fn shared_backend(config: &ServerConfig) -> Result<&CoordinationConfig, ServerError> {
    match config.coordination {
        CoordinationConfig::Memory => Err(ServerError::Config {
            context: "coordination",
            detail: "the memory backend only sees this process; configure etcd or redis to inspect a fleet".into(),
        }),
        _ => Ok(&config.coordination),
    }
}

pub async fn instances(args: ConfigArgs) -> Result<(), ServerError> {
    let coordination = connect(&args).await?;
    let result = coordination.get_instances().await;
    coordination.close().await?;

    let own = coordination.instance_id().as_str();
    for instance in result?.iter().filter(|i| i.as_str() != own) {
        println!("{instance}");
    }
    Ok(())
}

pub async fn version(args: VersionArgs) -> Result<(), ServerError> {
    let key = &args.key;
    let coordination = connect(&key.config).await?;
    let result = if args.bump {
        coordination.increment_version(&key.system, &key.collection).await
    } else {
        coordination.get_version(&key.system, &key.collection).await
    };
    coordination.close().await?;

    let version = result?;
    if args.bump {
        tracing::info!(system = %key.system, collection = %key.collection, version, "version bumped");
    }
    println!("{version}");
    Ok(())
}

pub async fn lock_status(args: KeyArgs) -> Result<(), ServerError> {
    let coordination = connect(&args.config).await?;
    let result = coordination.is_locked(&args.system, &args.collection).await;
    coordination.close().await?;

    println!("{}", if result? { "locked" } else { "free" });
    Ok(())
}
