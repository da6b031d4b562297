use crate::network::error::NetworkError;
use crate::network::subnet::SubnetError;
use crate::store::error::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Department not found: {tenant_id}")]
    NotFound { tenant_id: String },

    #[error("Department {tenant_id} has no network configured")]
    NotConfigured { tenant_id: String },

    #[error("Department {tenant_id} already has network {subnet} on {bridge}")]
    AlreadyConfigured {
        tenant_id: String,
        subnet: String,
        bridge: String,
    },

    #[error("Subnet rejected: {0}")]
    Subnet(#[from] SubnetError),

    #[error("Kernel prerequisites failed: {0}")]
    KernelPrerequisite(NetworkError),

    #[error("Network operation failed: {0}")]
    Network(#[from] NetworkError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid request: {message}")]
    Validation { message: String },
}

impl ReconcileError {
    pub fn not_found(tenant_id: &str) -> Self {
        ReconcileError::NotFound {
            tenant_id: tenant_id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ReconcileError::Validation {
            message: message.into(),
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
