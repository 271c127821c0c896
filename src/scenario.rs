//! End-to-end checks of a verified group, one per group mode.

use crate::{
    engine::Connector, error::GroupError, membership::MemberRole,
    orchestrator::ClusterOrchestrator, topology::GroupMode,
};
use std::time::Duration;

/// Checks a verified single-primary group.
///
/// The founder must be the only `PRIMARY`. Every secondary must reject a write of `schema`
/// with the super-read-only message; afterwards the primary creates `schema` and every
/// secondary must list it within `timeout`.
pub async fn single_primary<C: Connector>(
    orchestrator: &ClusterOrchestrator<C>,
    schema: &str,
    timeout: Duration,
) -> Result<(), GroupError> {
    require_mode(orchestrator, GroupMode::SinglePrimary)?;
    let count = orchestrator.topology().node_count();

    orchestrator.assert_role(0, MemberRole::Primary).await?;
    for index in 1..count {
        orchestrator.assert_role(index, MemberRole::Secondary).await?;
    }

    for index in 1..count {
        orchestrator.assert_write_rejected(index, schema).await?;
    }
    orchestrator.assert_schema_absent(schema).await?;

    orchestrator.assert_write_accepted(0, schema).await?;
    orchestrator.assert_propagated(0, schema, timeout).await?;
    log::info!("Single-primary scenario passed for {} nodes.", count);
    Ok(())
}

/// Checks a verified multi-primary group.
///
/// Every member must be `PRIMARY` and accept a write of its own schema, named
/// `<schema_prefix><position>` with positions starting at 1. Each schema must reach every
/// other member within `timeout`.
pub async fn multi_primary<C: Connector>(
    orchestrator: &ClusterOrchestrator<C>,
    schema_prefix: &str,
    timeout: Duration,
) -> Result<(), GroupError> {
    require_mode(orchestrator, GroupMode::MultiPrimary)?;
    let count = orchestrator.topology().node_count();
    let schemas: Vec<String> = (1..=count)
        .map(|position| format!("{}{}", schema_prefix, position))
        .collect();

    for index in 0..count {
        orchestrator.assert_role(index, MemberRole::Primary).await?;
    }
    for schema in &schemas {
        orchestrator.assert_schema_absent(schema).await?;
    }
    for (index, schema) in schemas.iter().enumerate() {
        orchestrator.assert_write_accepted(index, schema).await?;
    }
    for (index, schema) in schemas.iter().enumerate() {
        orchestrator.assert_propagated(index, schema, timeout).await?;
    }
    log::info!("Multi-primary scenario passed for {} nodes.", count);
    Ok(())
}

fn require_mode<C: Connector>(
    orchestrator: &ClusterOrchestrator<C>,
    mode: GroupMode,
) -> Result<(), GroupError> {
    let actual = orchestrator.topology().mode();
    if actual == mode {
        Ok(())
    } else {
        Err(GroupError::Config(format!(
            "scenario for {:?} run against a {:?} group",
            mode, actual
        )))
    }
}
