//! Plan construction from a migration intent.
//!
//! The builder emits a fixed skeleton of stages. Optional stages are skipped
//! according to [`PlanOptions`], and every step of a stage depends on every
//! step of the previously emitted stage.

use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use super::{MigrationPlan, MigrationStep, Platform, Stage};
use crate::error::{MigrationError, Result};

/// Option key: insert the backup stage.
pub const OPT_CREATE_BACKUP: &str = "create_backup";
/// Option key: insert the cleanup stage.
pub const OPT_CLEANUP_TEMP_FILES: &str = "cleanup_temp_files";
/// Option key: add content verification next to the health check.
pub const OPT_VERIFY_INTEGRITY: &str = "verify_integrity";
/// Option key: add media export and import steps.
pub const OPT_MIGRATE_MEDIA: &str = "migrate_media";

const RECOGNIZED: [&str; 4] = [
    OPT_CREATE_BACKUP,
    OPT_CLEANUP_TEMP_FILES,
    OPT_VERIFY_INTEGRITY,
    OPT_MIGRATE_MEDIA,
];

/// Resolved builder options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    /// Insert the backup stage.
    pub create_backup: bool,
    /// Insert the cleanup stage.
    pub cleanup_temp_files: bool,
    /// Add content verification.
    pub verify_integrity: bool,
    /// Add media export and import.
    pub migrate_media: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
            cleanup_temp_files: true,
            verify_integrity: true,
            migrate_media: true,
        }
    }
}

impl PlanOptions {
    /// Resolve options from a free-form map.
    ///
    /// Unrecognized keys are ignored here and preserved in plan metadata by
    /// the builder.
    pub fn from_map(options: &Map<String, Value>) -> Result<Self> {
        let mut resolved = Self::default();
        for key in RECOGNIZED {
            let Some(value) = options.get(key) else {
                continue;
            };
            let flag = value.as_bool().ok_or_else(|| {
                MigrationError::Configuration(format!(
                    "option '{}' must be a boolean, got {}",
                    key, value
                ))
            })?;
            match key {
                OPT_CREATE_BACKUP => resolved.create_backup = flag,
                OPT_CLEANUP_TEMP_FILES => resolved.cleanup_temp_files = flag,
                OPT_VERIFY_INTEGRITY => resolved.verify_integrity = flag,
                _ => resolved.migrate_media = flag,
            }
        }
        Ok(resolved)
    }

    fn write_into(&self, metadata: &mut Map<String, Value>) {
        metadata.insert(OPT_CREATE_BACKUP.into(), Value::Bool(self.create_backup));
        metadata.insert(
            OPT_CLEANUP_TEMP_FILES.into(),
            Value::Bool(self.cleanup_temp_files),
        );
        metadata.insert(
            OPT_VERIFY_INTEGRITY.into(),
            Value::Bool(self.verify_integrity),
        );
        metadata.insert(OPT_MIGRATE_MEDIA.into(), Value::Bool(self.migrate_media));
    }
}

/// Builds migration plans from platform pairs and options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanBuilder;

impl PlanBuilder {
    /// Create a builder.
    pub fn new() -> Self {
        Self
    }

    /// Build a plan from string platform identifiers.
    ///
    /// Unknown identifiers are a configuration error.
    pub fn build_from_names(
        &self,
        source: &str,
        destination: &str,
        source_path: &str,
        destination_path: &str,
        options: &Map<String, Value>,
    ) -> Result<MigrationPlan> {
        let source: Platform = source.parse()?;
        let destination: Platform = destination.parse()?;
        self.build(source, destination, source_path, destination_path, options)
    }

    /// Build a plan.
    pub fn build(
        &self,
        source: Platform,
        destination: Platform,
        source_path: &str,
        destination_path: &str,
        options: &Map<String, Value>,
    ) -> Result<MigrationPlan> {
        if source_path.trim().is_empty() {
            return Err(MigrationError::Configuration(
                "source location must not be empty".to_string(),
            ));
        }
        if destination_path.trim().is_empty() {
            return Err(MigrationError::Configuration(
                "destination location must not be empty".to_string(),
            ));
        }

        let opts = PlanOptions::from_map(options)?;
        let stages = self.stages(source, destination, &opts);

        let mut steps = Vec::new();
        let mut previous: Vec<String> = Vec::new();
        for (stage, stage_steps) in stages {
            let ids: Vec<String> = stage_steps.iter().map(|s| s.id.clone()).collect();
            for step in stage_steps {
                steps.push(step.with_dependencies(previous.iter().cloned()));
            }
            debug!(stage = %stage, steps = ids.len(), "emitted stage");
            previous = ids;
        }

        let mut metadata = options.clone();
        opts.write_into(&mut metadata);

        let plan = MigrationPlan::from_steps(
            source,
            destination,
            source_path,
            destination_path,
            steps,
            metadata,
        )?;

        debug!(
            plan_id = %plan.id,
            source = %source,
            destination = %destination,
            steps = plan.steps.len(),
            "built migration plan"
        );
        Ok(plan)
    }

    fn stages(
        &self,
        source: Platform,
        destination: Platform,
        opts: &PlanOptions,
    ) -> Vec<(Stage, Vec<MigrationStep>)> {
        let mut stages = Vec::with_capacity(Stage::ALL.len());

        stages.push((
            Stage::Preparation,
            vec![step(
                Stage::Preparation,
                "initialize",
                "Initialize migration",
                "Create working directories and record migration metadata",
                30,
            )],
        ));

        stages.push((
            Stage::Validation,
            vec![
                step(
                    Stage::Validation,
                    "analyze_source",
                    "Analyze source",
                    format!("Inspect the {} source installation", source.display_name()),
                    120,
                ),
                step(
                    Stage::Validation,
                    "check_destination",
                    "Check destination",
                    format!(
                        "Verify the {} destination is reachable and writable",
                        destination.display_name()
                    ),
                    60,
                ),
            ],
        ));

        if opts.create_backup {
            stages.push((
                Stage::Backup,
                vec![step(
                    Stage::Backup,
                    "create_backup",
                    "Create backup",
                    "Snapshot the source before any data is moved",
                    600,
                )],
            ));
        }

        let mut export = vec![step(
            Stage::Export,
            "export_content",
            "Export content",
            format!("Extract content from {}", source.display_name()),
            900,
        )];
        if opts.migrate_media {
            export.push(step(
                Stage::Export,
                "export_media",
                "Export media",
                "Copy uploaded media out of the source",
                1200,
            ));
        }
        stages.push((Stage::Export, export));

        if source != destination {
            stages.push((
                Stage::Transform,
                vec![step(
                    Stage::Transform,
                    "convert_content",
                    "Convert content",
                    format!(
                        "Convert {} content into the {} format",
                        source.display_name(),
                        destination.display_name()
                    ),
                    600,
                )],
            ));
        }

        let mut import = vec![step(
            Stage::Import,
            "import_content",
            "Import content",
            format!("Load content into {}", destination.display_name()),
            900,
        )];
        if opts.migrate_media {
            import.push(step(
                Stage::Import,
                "import_media",
                "Import media",
                "Upload media into the destination",
                1200,
            ));
        }
        stages.push((Stage::Import, import));

        stages.push((
            Stage::Configuration,
            vec![step(
                Stage::Configuration,
                "apply_settings",
                "Apply settings",
                "Apply site settings, permalinks and redirects",
                300,
            )],
        ));

        let mut verification = vec![step(
            Stage::Verification,
            "health_check",
            "Health check",
            "Check that the destination responds correctly",
            60,
        )];
        if opts.verify_integrity {
            verification.push(step(
                Stage::Verification,
                "verify_content",
                "Verify content",
                "Compare migrated content against the export",
                300,
            ));
        }
        stages.push((Stage::Verification, verification));

        if opts.cleanup_temp_files {
            stages.push((
                Stage::Cleanup,
                vec![step(
                    Stage::Cleanup,
                    "remove_temp_files",
                    "Remove temporary files",
                    "Delete export archives and working directories",
                    120,
                )],
            ));
        }

        stages.push((
            Stage::Completion,
            vec![step(
                Stage::Completion,
                "finalize",
                "Finalize migration",
                "Record the migration summary",
                30,
            )],
        ));

        stages
    }
}

fn step(
    stage: Stage,
    slug: &str,
    name: &str,
    description: impl Into<String>,
    estimate_secs: u64,
) -> MigrationStep {
    MigrationStep::new(format!("{}.{}", stage.as_str(), slug), name, stage)
        .with_description(description)
        .with_estimated_duration(Duration::from_secs(estimate_secs))
}
