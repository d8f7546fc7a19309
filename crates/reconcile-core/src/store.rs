//! Resource store abstraction
//!
//! The controllers only talk to the orchestration API through
//! [`ResourceStore`]. [`KubeStore`] is the production implementation; the
//! `test-util` feature adds an in-memory one for unit tests.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cursor::WatchCursor;
use crate::error::StoreError;
use crate::event::{WatchEvent, WatchFault};

/// Server-side watch timeout. Must stay below the API server's 295s cap.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Stream of watch events for one resource kind.
pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>, StoreError>>;

/// Result of a full list call.
#[derive(Debug, Clone)]
pub struct Listing<K> {
    /// Objects across all namespaces
    pub items: Vec<K>,
    /// Resource version the listing is consistent with
    pub resource_version: String,
}

/// CRUD and watch operations for one resource kind.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Lists every object of the kind, cluster-wide.
    async fn list(&self) -> Result<Listing<K>, StoreError>;

    /// Opens a watch positioned after `cursor`.
    async fn watch(&self, cursor: &WatchCursor) -> Result<EventStream<K>, StoreError>;

    /// Reads one object.
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError>;

    /// Creates an object. Fails with [`StoreError::AlreadyExists`] on a name clash.
    async fn create(&self, namespace: &str, object: &K) -> Result<K, StoreError>;

    /// Applies a JSON merge patch.
    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, StoreError>;

    /// Replaces the whole object.
    async fn replace(&self, namespace: &str, name: &str, object: &K) -> Result<K, StoreError>;

    /// Deletes an object.
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), StoreError>;
}

/// [`ResourceStore`] backed by the Kubernetes API.
pub struct KubeStore<K> {
    client: Client,
    kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    /// Creates a store sharing the given client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            kind: PhantomData,
        }
    }
}

impl<K> Debug for KubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    fn cluster_api(&self) -> Api<K> {
        Api::all(self.client.clone())
    }

    fn namespaced_api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Bookmarks stay on (the `WatchParams` default) so idle watches still
/// advance the cursor.
fn watch_params() -> WatchParams {
    WatchParams::default().timeout(WATCH_TIMEOUT_SECS)
}

fn into_watch_event<K>(event: kube::api::WatchEvent<K>) -> WatchEvent<K> {
    match event {
        kube::api::WatchEvent::Added(obj) => WatchEvent::Added(obj),
        kube::api::WatchEvent::Modified(obj) => WatchEvent::Modified(obj),
        kube::api::WatchEvent::Deleted(obj) => WatchEvent::Deleted(obj),
        kube::api::WatchEvent::Bookmark(bookmark) => {
            WatchEvent::Bookmark(bookmark.metadata.resource_version)
        }
        kube::api::WatchEvent::Error(err) => WatchEvent::Error(WatchFault {
            code: err.code,
            reason: err.reason.clone(),
            message: err.message.clone(),
        }),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    async fn list(&self) -> Result<Listing<K>, StoreError> {
        let list = self.cluster_api().list(&ListParams::default()).await?;
        debug!(
            "Listed {} {} objects",
            list.items.len(),
            K::kind(&K::DynamicType::default())
        );
        Ok(Listing {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(&self, cursor: &WatchCursor) -> Result<EventStream<K>, StoreError> {
        let params = watch_params();
        let stream = self.cluster_api().watch(&params, cursor.as_str()).await?;
        Ok(stream
            .map(|item| item.map(into_watch_event).map_err(StoreError::from))
            .boxed())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        Ok(self.namespaced_api(namespace).get(name).await?)
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, StoreError> {
        Ok(self
            .namespaced_api(namespace)
            .create(&PostParams::default(), object)
            .await?)
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, StoreError> {
        Ok(self
            .namespaced_api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn replace(&self, namespace: &str, name: &str, object: &K) -> Result<K, StoreError> {
        Ok(self
            .namespaced_api(namespace)
            .replace(name, &PostParams::default(), object)
            .await?)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), StoreError> {
        let params = DeleteParams {
            grace_period_seconds,
            ..DeleteParams::default()
        };
        self.namespaced_api(namespace).delete(name, &params).await?;
        Ok(())
    }
}
