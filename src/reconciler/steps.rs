use serde::{Deserialize, Serialize};
use std::future::Future;

/// Result of one teardown step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub attempted: bool,
    pub success: bool,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn skipped(step: &str) -> Self {
        Self {
            step: step.to_string(),
            attempted: false,
            success: true,
            error: None,
        }
    }
}

/// Per-step account of a Destroy or ForceDestroy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub tenant_id: String,
    pub bridge: Option<String>,
    pub steps: Vec<StepOutcome>,
}

impl TeardownReport {
    pub fn new(tenant_id: &str, bridge: Option<&str>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            bridge: bridge.map(str::to_string),
            steps: Vec::new(),
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.success)
    }

    pub fn failures(&self) -> Vec<&StepOutcome> {
        self.steps.iter().filter(|s| !s.success).collect()
    }

    pub fn step(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == name)
    }

    pub fn log_summary(&self) {
        let failed = self.failures();
        if failed.is_empty() {
            tracing::info!(
                "Teardown of {} finished: {} steps ok",
                self.tenant_id,
                self.steps.len()
            );
        } else {
            for step in &failed {
                tracing::warn!(
                    "Teardown of {}: step {} failed: {}",
                    self.tenant_id,
                    step.step,
                    step.error.as_deref().unwrap_or("unknown error")
                );
            }
            tracing::warn!(
                "Teardown of {} finished with {}/{} failed steps",
                self.tenant_id,
                failed.len(),
                self.steps.len()
            );
        }
    }
}

/// Run one teardown step then its independent check.
///
/// `verify` is only polled after `action` completes. A step succeeds when
/// the action returned Ok and the check confirms the resource is gone.
pub async fn run_step<A, V>(name: &str, action: A, verify: V) -> StepOutcome
where
    A: Future<Output = Result<(), String>>,
    V: Future<Output = bool>,
{
    let action_result = action.await;
    let verified = verify.await;

    let error = match (&action_result, verified) {
        (Ok(()), true) => None,
        (Err(e), _) => Some(e.clone()),
        (Ok(()), false) => Some("verification failed".to_string()),
    };

    match &error {
        None => tracing::debug!("Step {} ok", name),
        Some(e) => tracing::warn!("Step {} failed: {}", name, e),
    }

    StepOutcome {
        step: name.to_string(),
        attempted: true,
        success: error.is_none(),
        error,
    }
}
