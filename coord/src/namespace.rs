use crate::{
    client::{Acl, ConnectionState, CoordinationClient, NodeStat, SessionId},
    Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

/// Namespace root under which an application keeps its nodes
pub fn app_namespace(app_name: &str) -> String {
    format!("services/{}", app_name.trim_matches('/'))
}

/// Scopes every path of the wrapped client under `/<namespace>/`
#[derive(Debug)]
pub struct NamespacedClient<C> {
    inner: C,
    namespace: String,
}

impl<C: CoordinationClient> NamespacedClient<C> {
    pub fn new(inner: C, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into().trim_matches('/').to_string();
        Self { inner, namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Absolute path of `path` inside the namespace
    pub fn full_path(&self, path: &str) -> String {
        let relative = path.trim_start_matches('/');
        if self.namespace.is_empty() {
            format!("/{relative}")
        } else {
            format!("/{}/{}", self.namespace, relative)
        }
    }
}

#[async_trait]
impl<C: CoordinationClient> CoordinationClient for NamespacedClient<C> {
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
        self.inner.exists(&self.full_path(path)).await
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.inner.read(&self.full_path(path)).await
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8], acl: Acl) -> Result<()> {
        self.inner
            .create_ephemeral(&self.full_path(path), data, acl)
            .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(&self.full_path(path)).await
    }

    async fn delete_guaranteed(&self, path: &str) -> Result<()> {
        self.inner.delete_guaranteed(&self.full_path(path)).await
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    fn current_session(&self) -> Option<SessionId> {
        self.inner.current_session()
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.subscribe()
    }
}
