use crate::reconciler::Fabric;

/// Compensation for one completed provisioning step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    RemoveNat { bridge: String, subnet: String },
    KillDaemon { bridge: String },
    RemoveDaemonFiles { bridge: String },
    DeleteBridge { bridge: String },
}

impl UndoAction {
    async fn run(&self, fabric: &Fabric) -> Result<(), String> {
        match self {
            UndoAction::RemoveNat { bridge, subnet } => fabric
                .nat
                .remove_masquerade(bridge, subnet)
                .await
                .map_err(|e| e.to_string()),
            UndoAction::KillDaemon { bridge } => fabric
                .dhcp
                .kill_by_bridge(bridge)
                .await
                .map_err(|e| e.to_string()),
            UndoAction::RemoveDaemonFiles { bridge } => fabric
                .dhcp
                .remove_files(bridge)
                .await
                .map_err(|e| e.to_string()),
            UndoAction::DeleteBridge { bridge } => fabric
                .bridges
                .delete_bridge(bridge)
                .await
                .map_err(|e| e.to_string()),
        }
    }
}

/// Undo actions pushed as provisioning advances, run newest first on failure
#[derive(Debug, Default)]
pub struct UndoStack {
    actions: Vec<UndoAction>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Provisioning finished; nothing to undo
    pub fn commit(mut self) {
        self.actions.clear();
    }

    /// Run every action in reverse. Errors are logged, never returned.
    /// Returns how many actions failed.
    pub async fn unwind(mut self, fabric: &Fabric) -> usize {
        let mut failures = 0;
        while let Some(action) = self.actions.pop() {
            match action.run(fabric).await {
                Ok(()) => tracing::debug!("Rolled back {:?}", action),
                Err(e) => {
                    failures += 1;
                    tracing::warn!("Rollback step {:?} failed: {}", action, e);
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFabric;

    #[tokio::test]
    async fn test_unwind_runs_newest_first_and_absorbs_errors() {
        let fakes = TestFabric::new();
        fakes.bridges.seed_bridge("dept-acme", &[]);
        fakes.bridges.fail_delete_of("dept-acme");
        let fabric = fakes.fabric();

        let mut stack = UndoStack::new();
        stack.push(UndoAction::DeleteBridge {
            bridge: "dept-acme".to_string(),
        });
        stack.push(UndoAction::RemoveDaemonFiles {
            bridge: "dept-acme".to_string(),
        });
        stack.push(UndoAction::KillDaemon {
            bridge: "dept-acme".to_string(),
        });
        stack.push(UndoAction::RemoveNat {
            bridge: "dept-acme".to_string(),
            subnet: "10.10.1.0/24".to_string(),
        });
        assert_eq!(stack.len(), 4);

        let failures = stack.unwind(&fabric).await;
        assert_eq!(failures, 1);

        assert_eq!(fakes.nat.calls(), vec!["remove_masquerade dept-acme 10.10.1.0/24"]);
        assert_eq!(
            fakes.dhcp.calls(),
            vec!["kill_by_bridge dept-acme", "remove_files dept-acme"]
        );
        assert_eq!(fakes.bridges.calls(), vec!["delete_bridge dept-acme"]);
    }

    #[tokio::test]
    async fn test_commit_discards_actions() {
        let fakes = TestFabric::new();
        let mut stack = UndoStack::new();
        stack.push(UndoAction::DeleteBridge {
            bridge: "dept-acme".to_string(),
        });
        stack.commit();
        assert!(fakes.bridges.calls().is_empty());
    }
}
