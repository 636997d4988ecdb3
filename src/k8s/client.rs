//! Kubernetes client construction.

use tracing::debug;

use crate::error::{HostUpgradesError, Result};

/// Build a client from the in-cluster service account, falling back to the
/// local kubeconfig.
pub async fn build_client() -> Result<kube::Client> {
    let client = kube::Client::try_default()
        .await
        .map_err(|e| HostUpgradesError::from_kube("kube client", e))?;

    debug!(
        default_namespace = client.default_namespace(),
        "Kubernetes client initialized"
    );
    Ok(client)
}
