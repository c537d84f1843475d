use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use strata_common::{DocumentSummary, StageId};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{QueryResolution, interrupted_warning, resolve_queries, unmet_requirement};
use crate::errors::StageError;
use crate::pipeline::{Stage, StageContext, StageOutcome, StageReport};

/// Exit code a stage command uses to say it does not apply.
const SKIP_EXIT_CODE: i32 = 2;

/// Runs a shell command as the stage body.
///
/// The command receives a JSON payload on stdin with the resolved queries
/// and the summaries of earlier stages. Exit 0 publishes the JSON report
/// printed on stdout (an empty stdout publishes an empty report), exit 2
/// skips the stage with stderr as the reason, and anything else fails it.
pub struct CommandStage {
    id: StageId,
    command: String,
    working_dir: PathBuf,
}

#[derive(Serialize)]
struct StagePayload<'a> {
    run_id: &'a str,
    stage: &'a StageId,
    phase: &'a str,
    recommendations: BTreeMap<&'a StageId, &'a [String]>,
    context: BTreeMap<&'a StageId, &'a DocumentSummary>,
    resolutions: &'a [QueryResolution],
}

impl CommandStage {
    pub fn new(id: StageId, command: impl Into<String>, working_dir: &Path) -> Self {
        Self {
            id,
            command: command.into(),
            working_dir: working_dir.to_path_buf(),
        }
    }

    fn parse_output(&self, output: &std::process::Output) -> Result<StageOutcome, StageError> {
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match exit_code {
            0 if stdout.trim().is_empty() => Ok(StageOutcome::Completed(StageReport::default())),
            0 => serde_json::from_str::<StageReport>(stdout.trim())
                .map(StageOutcome::Completed)
                .map_err(StageError::MalformedReport),
            SKIP_EXIT_CODE => {
                let reason = if stderr.trim().is_empty() {
                    format!("stage command for {} requested skip", self.id)
                } else {
                    stderr.trim().to_string()
                };
                Ok(StageOutcome::Skipped { reason })
            }
            _ => Err(StageError::NonZeroExit {
                exit_code,
                stderr: stderr.trim().to_string(),
            }),
        }
    }
}

/// Report for a command stage stopped by an abort before its command ran.
fn interrupted_report(
    resolutions: &[QueryResolution],
    total: usize,
) -> Result<StageReport, StageError> {
    let mut report = StageReport::default();
    report
        .summary
        .warnings
        .push(interrupted_warning(resolutions.len(), total));
    let resolved = serde_json::to_value(resolutions).map_err(|e| StageError::Other(e.into()))?;
    report.data.insert("resolutions".to_string(), resolved);
    report
        .data
        .insert(StageReport::COMPLETE_KEY.to_string(), serde_json::Value::Bool(false));
    Ok(report)
}

#[async_trait]
impl Stage for CommandStage {
    fn id(&self) -> &StageId {
        &self.id
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutcome, StageError> {
        if let Some(reason) = unmet_requirement(&ctx).await? {
            return Ok(StageOutcome::Skipped { reason });
        }
        let (resolutions, complete) = resolve_queries(&ctx, true).await?;
        if !complete {
            tracing::warn!(stage = %self.id, "abort requested before the command started");
            return Ok(StageOutcome::Completed(interrupted_report(
                &resolutions,
                ctx.spec.queries.len(),
            )?));
        }

        let payload = StagePayload {
            run_id: &ctx.run_id,
            stage: &self.id,
            phase: &ctx.phase_label,
            recommendations: ctx.recommendations(),
            context: ctx
                .prior
                .iter()
                .map(|(stage, doc)| (stage, &doc.summary))
                .collect(),
            resolutions: &resolutions,
        };
        let payload = serde_json::to_string(&payload).map_err(|e| StageError::Other(e.into()))?;

        tracing::debug!(stage = %self.id, command = %self.command, "spawning stage command");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("STRATA_RUN_ID", &ctx.run_id)
            .env("STRATA_STAGE", self.id.as_str())
            .env("STRATA_PHASE", &ctx.phase_label)
            .env("STRATA_CONTEXT_DIR", &ctx.context_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StageError::SpawnFailed {
                command: self.command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(payload.as_bytes()).await
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(StageError::Other(e.into()));
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StageError::Other(e.into()))?;
        tracing::debug!(
            stage = %self.id,
            exit_code = output.status.code().unwrap_or(-1),
            "stage command finished"
        );
        self.parse_output(&output)
    }
}
