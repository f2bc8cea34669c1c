//! The remote surfaces the reconciler drives, behind traits so the state
//! machine can be exercised without a cluster or a cloud account.

use anyhow::Result;
use kstage_apply::ManifestDoc;
use kstage_core::{Presence, ResourcePhase};
use kstage_kubehub::ResourceRef;
use kstage_ops::{CloudCli, CommandRunner, ProcessRunner};
use kstage_retry::AttemptFailure;
use kube::Client;

/// Cluster API operations (collaborator b).
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// One apply attempt; the failure text feeds the retry classifier.
    async fn apply(&self, doc: &ManifestDoc) -> Result<(), AttemptFailure>;

    /// `None` when the object does not exist.
    async fn phase(&self, target: &ResourceRef) -> Result<Option<ResourcePhase>>;

    async fn presence(&self, target: &ResourceRef) -> Result<Presence>;

    /// Issue the delete and return without waiting. `false` when already gone.
    async fn request_delete(&self, target: &ResourceRef) -> Result<bool>;

    async fn list_names(&self, gvk_key: &str, namespace: &str) -> Result<Vec<String>>;

    /// `(available, detail)` for a controller deployment.
    async fn deployment_available(&self, namespace: &str, name: &str) -> Result<(bool, String)>;
}

/// Cloud provider checks (collaborator c).
#[async_trait::async_trait]
pub trait CloudApi: Send + Sync {
    async fn container_exists(&self, name: &str) -> Result<bool>;
}

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect() -> Result<Self> {
        Ok(Self::new(kstage_kubehub::get_kube_client().await?))
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn apply(&self, doc: &ManifestDoc) -> Result<(), AttemptFailure> {
        kstage_apply::apply_document(self.client.clone(), doc)
            .await
            .map(|_| ())
            .map_err(|e| AttemptFailure::from_error(format!("{:#}", e)))
    }

    async fn phase(&self, target: &ResourceRef) -> Result<Option<ResourcePhase>> {
        let obj = kstage_kubehub::get_opt(self.client.clone(), target).await?;
        Ok(obj.map(|o| ResourcePhase::parse(kstage_kubehub::status_phase(&o).as_deref())))
    }

    async fn presence(&self, target: &ResourceRef) -> Result<Presence> {
        Ok(match kstage_kubehub::get_opt(self.client.clone(), target).await? {
            None => Presence::Absent,
            Some(o) if kstage_kubehub::is_terminating(&o) => Presence::Deleting,
            Some(_) => Presence::Exists,
        })
    }

    async fn request_delete(&self, target: &ResourceRef) -> Result<bool> {
        kstage_kubehub::delete(self.client.clone(), target).await
    }

    async fn list_names(&self, gvk_key: &str, namespace: &str) -> Result<Vec<String>> {
        kstage_kubehub::list_names(self.client.clone(), gvk_key, Some(namespace)).await
    }

    async fn deployment_available(&self, namespace: &str, name: &str) -> Result<(bool, String)> {
        kstage_kubehub::deployment_available(self.client.clone(), namespace, name).await
    }
}

/// Resource-group checks through the `az` CLI.
pub struct AzCloud<R = ProcessRunner> {
    cli: CloudCli<R>,
}

impl AzCloud<ProcessRunner> {
    pub fn new() -> Self {
        Self { cli: CloudCli::new() }
    }
}

impl Default for AzCloud<ProcessRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> AzCloud<R> {
    pub fn with_cli(cli: CloudCli<R>) -> Self {
        Self { cli }
    }
}

#[async_trait::async_trait]
impl<R: CommandRunner> CloudApi for AzCloud<R> {
    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.cli.group_exists(name).await?)
    }
}
