//! Orchestrator -- runs the due tenants, one at a time.
//!
//! Per tenant: decrypt credentials, run the extraction pipeline under the
//! automation retry policy, hand the artifact to the sheet sink, append one
//! run-log entry, clear the manual-run flag. A tenant's failure never stops
//! the tenants after it.

use chrono::{DateTime, Utc};
use tracing::Instrument;
use uuid::Uuid;

use crate::artifact;
use crate::config::Config;
use crate::driver::BrowserLauncher;
use crate::pipeline::{self, ExtractionPipeline, PipelineError};
use crate::retry::{self, ErrorClass, RetryPolicy, Sleeper};
use crate::schedule::{self, SCHEDULE_TZ};
use crate::sink::SheetSink;
use crate::store::{RunLog, RunRecord, Tenant, TenantStore};
use crate::vault::{Credentials, Vault};

/// Everything the orchestrator composes over, injected at construction.
pub struct EngineDeps<'a> {
    pub tenants: &'a TenantStore,
    pub log: &'a RunLog,
    pub vault: &'a Vault,
    pub launcher: &'a dyn BrowserLauncher,
    pub sink: &'a dyn SheetSink,
    pub sleeper: &'a dyn Sleeper,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl RunSummary {
    /// Process exit contract: success when every selected tenant succeeded,
    /// including the case where nothing was due.
    pub fn all_ok(&self) -> bool {
        self.failed == 0
    }
}

/// One scheduling pass: select the due tenants and process them in order.
///
/// `tenant_override` bypasses the decider and selects exactly that tenant,
/// schedule and dedup notwithstanding; the active flag is still honored.
pub async fn run_once(
    cfg: &Config,
    deps: &EngineDeps<'_>,
    tenant_override: Option<&str>,
    now_utc: DateTime<Utc>,
) -> anyhow::Result<RunSummary> {
    let now_local = now_utc.with_timezone(&SCHEDULE_TZ);

    let selected: Vec<Tenant> = match tenant_override {
        Some(name) => {
            let tenant = deps
                .tenants
                .get_by_name(name)?
                .ok_or_else(|| anyhow::anyhow!("tenant '{}' not found", name))?;
            if tenant.active {
                vec![tenant]
            } else {
                tracing::warn!(tenant = %name, "tenant is inactive, nothing to run");
                Vec::new()
            }
        }
        None => {
            let tenants = deps.tenants.list_active()?;
            schedule::select_due(&tenants, now_local, deps.log)?
                .into_iter()
                .cloned()
                .collect()
        }
    };

    let mut summary = RunSummary {
        selected: selected.len(),
        ..Default::default()
    };
    tracing::info!(
        selected = summary.selected,
        local_hour = %now_local.format("%H"),
        "scheduling pass"
    );

    for tenant in &selected {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("tenant_run", tenant = %tenant.name, %run_id);

        let (success, message, artifact_path, sheet_updated) = process_tenant(cfg, deps, tenant, now_utc)
            .instrument(span.clone())
            .await;
        let _guard = span.enter();

        if success {
            summary.succeeded += 1;
            tracing::info!(%message, "tenant run succeeded");
        } else {
            summary.failed += 1;
            tracing::error!(%message, "tenant run failed");
        }

        // Exactly one log entry per attempt, then the unconditional flag
        // clear; both committed before the next tenant starts.
        if let Err(e) = deps.log.append(&RunRecord {
            tenant_id: tenant.id,
            attempted_at: Utc::now(),
            success,
            message,
            artifact_path,
            sheet_updated,
        }) {
            tracing::error!(error = %e, "failed to append run log entry");
        }
        if let Err(e) = deps.tenants.clear_manual_run(tenant.id) {
            tracing::error!(error = %e, "failed to clear manual-run flag");
        }
    }

    Ok(summary)
}

/// Run one tenant end to end. Never propagates: every outcome collapses into
/// (success, message, artifact_path, sheet_updated) for the single log entry.
async fn process_tenant(
    cfg: &Config,
    deps: &EngineDeps<'_>,
    tenant: &Tenant,
    now_utc: DateTime<Utc>,
) -> (bool, String, Option<String>, bool) {
    let creds = match build_credentials(cfg, deps.vault, tenant) {
        Ok(creds) => creds,
        Err(e) => return (false, format!("credential error: {e}"), None, false),
    };

    let pipeline = ExtractionPipeline::new(
        &cfg.dashboard,
        deps.launcher,
        deps.sleeper,
        &cfg.download_dir,
        cfg.headless,
    );
    let report_date = pipeline::report_date(now_utc.with_timezone(&SCHEDULE_TZ));

    let extraction = retry::retry(
        RetryPolicy::AUTOMATION,
        deps.sleeper,
        |e: &PipelineError| {
            if e.is_retryable() {
                ErrorClass::Retryable
            } else {
                ErrorClass::Fatal
            }
        },
        |_attempt| pipeline.run(&creds, report_date),
    )
    .await;

    let path = match extraction {
        Ok(path) => path,
        Err(e) => return (false, format!("extraction failed: {e}"), None, false),
    };
    let artifact_path = Some(path.display().to_string());

    // Download is done; from here on a failure still records the artifact so
    // partial progress stays diagnosable.
    let rows = match artifact::rows_from_artifact(&path) {
        Ok(rows) => rows,
        Err(e) => return (false, format!("artifact conversion failed: {e:#}"), artifact_path, false),
    };

    let upload = retry::retry(
        RetryPolicy::REMOTE,
        deps.sleeper,
        |e: &crate::sink::SinkError| e.class(),
        |_attempt| {
            deps.sink.write(
                &rows,
                &tenant.sheet_id,
                &cfg.sink.sheet_name,
                cfg.sink.clear_existing,
            )
        },
    )
    .await;

    match upload {
        Ok(()) => {
            if !cfg.keep_files {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(file = %path.display(), error = %e, "could not remove downloaded file");
                }
            }
            (
                true,
                format!("report for {report_date} extracted and uploaded"),
                artifact_path,
                true,
            )
        }
        Err(e) => (false, format!("upload failed: {e}"), artifact_path, false),
    }
}

fn build_credentials(
    cfg: &Config,
    vault: &Vault,
    tenant: &Tenant,
) -> Result<Credentials, crate::vault::VaultError> {
    let password = vault.decrypt(&tenant.password_enc)?;
    let pin = match &tenant.pin_enc {
        Some(blob) => Some(vault.decrypt(blob)?),
        None => cfg.default_pin.clone(),
    };
    Ok(Credentials {
        username: tenant.username.clone(),
        password,
        pin,
        scope_selector: tenant.scope_selector.clone(),
    })
}
