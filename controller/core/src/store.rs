use crate::model::{Protection, ProtectionFilter, StateType};
use anyhow::Result;
use std::sync::Arc;

/// Read access to the policy store.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    /// Returns the opaque token that changes whenever the collection changes.
    async fn state_version(&self, state: StateType) -> Result<String>;

    async fn list_protections(&self, filter: ProtectionFilter) -> Result<Vec<Protection>>;
}

#[async_trait::async_trait]
impl<S: PolicyStore + ?Sized> PolicyStore for Arc<S> {
    async fn state_version(&self, state: StateType) -> Result<String> {
        (**self).state_version(state).await
    }

    async fn list_protections(&self, filter: ProtectionFilter) -> Result<Vec<Protection>> {
        (**self).list_protections(filter).await
    }
}
