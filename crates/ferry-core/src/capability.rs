//! Platform capabilities consumed by step handlers.
//!
//! The orchestrator does not know how to export a WordPress site or check
//! the health of a Ghost blog. Those operations come from implementations of
//! the traits below, adapted to steps by the matching handlers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StepExecutionError;
use crate::handler::{HandlerResult, StepContext, StepHandler};
use crate::plan::{PlanInfo, Platform};

/// Step id of the backup step emitted by the builder.
pub const BACKUP_STEP_ID: &str = "backup.create_backup";

/// Analyze, export and import operations of one platform.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Platform this adapter speaks.
    fn platform(&self) -> Platform;

    /// Inspect an installation.
    async fn analyze(&self, location: &str) -> Result<Value, StepExecutionError>;

    /// Extract content, given the analysis if one was made.
    async fn export(
        &self,
        location: &str,
        analysis: Option<&Value>,
    ) -> Result<Value, StepExecutionError>;

    /// Load an exported (or converted) payload.
    async fn import(&self, location: &str, payload: &Value) -> Result<Value, StepExecutionError>;
}

/// Outcome of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall verdict.
    pub healthy: bool,
    /// Short explanation.
    pub message: String,
}

/// Liveness probe for a migrated installation.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Check the installation at `location`.
    async fn check(&self, location: &str) -> Result<HealthReport, StepExecutionError>;
}

/// A backup taken before data was moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Provider specific identifier.
    pub backup_id: String,
    /// Where the backup lives.
    pub location: String,
    /// When it was taken.
    pub created_at: DateTime<Utc>,
}

/// Creates backups and restores them on explicit request.
#[async_trait]
pub trait BackupProvider: Send + Sync {
    /// Take a backup of the plan's source.
    async fn create_backup(&self, plan: &PlanInfo) -> Result<BackupRecord, StepExecutionError>;

    /// Restore a backup.
    async fn rollback(
        &self,
        plan: &PlanInfo,
        backup: &BackupRecord,
    ) -> Result<(), StepExecutionError>;
}

/// Which adapter operation a [`PlatformStepHandler`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformOperation {
    /// Analyze the source.
    Analyze,
    /// Export from the source.
    Export,
    /// Import into the destination.
    Import,
}

/// Runs a [`PlatformAdapter`] operation as a step.
pub struct PlatformStepHandler {
    adapter: Arc<dyn PlatformAdapter>,
    operation: PlatformOperation,
    inputs: Vec<String>,
}

impl PlatformStepHandler {
    /// Analyze the plan's source location.
    pub fn analyze(adapter: Arc<dyn PlatformAdapter>) -> Self {
        Self {
            adapter,
            operation: PlatformOperation::Analyze,
            inputs: Vec::new(),
        }
    }

    /// Export the plan's source, fed by the source analysis.
    pub fn export(adapter: Arc<dyn PlatformAdapter>) -> Self {
        Self {
            adapter,
            operation: PlatformOperation::Export,
            inputs: vec!["validation.analyze_source".to_string()],
        }
    }

    /// Import into the plan's destination, fed by the converted content if
    /// the plan has a transform stage, else by the export.
    pub fn import(adapter: Arc<dyn PlatformAdapter>) -> Self {
        Self {
            adapter,
            operation: PlatformOperation::Import,
            inputs: vec![
                "transform.convert_content".to_string(),
                "export.export_content".to_string(),
            ],
        }
    }

    /// Override the upstream step ids searched, in order, for the input.
    pub fn with_inputs<I, S>(mut self, step_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = step_ids.into_iter().map(Into::into).collect();
        self
    }

    fn input<'a>(&self, ctx: &'a StepContext) -> Option<&'a Value> {
        self.inputs
            .iter()
            .find_map(|id| ctx.predecessor_result(id))
    }
}

#[async_trait]
impl StepHandler for PlatformStepHandler {
    async fn handle(&self, ctx: &StepContext) -> HandlerResult {
        let (expected, location) = match self.operation {
            PlatformOperation::Analyze | PlatformOperation::Export => {
                (ctx.plan.source, ctx.plan.source_path.as_str())
            }
            PlatformOperation::Import => (ctx.plan.destination, ctx.plan.destination_path.as_str()),
        };
        if self.adapter.platform() != expected {
            return Err(StepExecutionError::fatal(format!(
                "adapter for {} cannot serve a {} location",
                self.adapter.platform(),
                expected
            )));
        }

        debug!(
            plan_id = %ctx.plan.id,
            step_id = %ctx.step.id,
            operation = ?self.operation,
            location,
            "running platform operation"
        );

        let output = match self.operation {
            PlatformOperation::Analyze => self.adapter.analyze(location).await?,
            PlatformOperation::Export => self.adapter.export(location, self.input(ctx)).await?,
            PlatformOperation::Import => {
                let payload = self.input(ctx).ok_or_else(|| {
                    StepExecutionError::fatal(format!(
                        "no upstream payload to import (looked for {})",
                        self.inputs.join(", ")
                    ))
                })?;
                self.adapter.import(location, payload).await?
            }
        };
        Ok(Some(output))
    }
}

/// Runs a [`HealthCheck`] against the destination.
///
/// An unhealthy report is a retriable failure, since a freshly migrated site
/// may need a moment to come up.
pub struct HealthCheckHandler {
    check: Arc<dyn HealthCheck>,
}

impl HealthCheckHandler {
    /// Wrap a health check.
    pub fn new(check: Arc<dyn HealthCheck>) -> Self {
        Self { check }
    }
}

#[async_trait]
impl StepHandler for HealthCheckHandler {
    async fn handle(&self, ctx: &StepContext) -> HandlerResult {
        let report = self.check.check(&ctx.plan.destination_path).await?;
        if !report.healthy {
            return Err(StepExecutionError::retriable(format!(
                "destination unhealthy: {}",
                report.message
            )));
        }
        let payload = serde_json::to_value(&report)
            .map_err(|e| StepExecutionError::fatal(format!("encode health report: {}", e)))?;
        Ok(Some(payload))
    }
}

/// Runs [`BackupProvider::create_backup`] as a step.
///
/// The step result is the serialized [`BackupRecord`], which a later explicit
/// rollback reads back.
pub struct BackupStepHandler {
    provider: Arc<dyn BackupProvider>,
}

impl BackupStepHandler {
    /// Wrap a backup provider.
    pub fn new(provider: Arc<dyn BackupProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl StepHandler for BackupStepHandler {
    async fn handle(&self, ctx: &StepContext) -> HandlerResult {
        let record = self.provider.create_backup(&ctx.plan).await?;
        info!(
            plan_id = %ctx.plan.id,
            backup_id = %record.backup_id,
            location = %record.location,
            "backup created"
        );
        let payload = serde_json::to_value(&record)
            .map_err(|e| StepExecutionError::fatal(format!("encode backup record: {}", e)))?;
        Ok(Some(payload))
    }
}
