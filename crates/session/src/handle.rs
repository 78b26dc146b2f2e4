use std::sync::Arc;

use studio_comfyui::Backend;
use tokio::sync::RwLock;

/// Shared, swappable reference to the current backend gateway.
///
/// Changing the server address replaces the gateway in place; everyone
/// holding a clone of the handle sees the new one on their next call.
#[derive(Clone)]
pub struct BackendHandle {
    inner: Arc<RwLock<Arc<dyn Backend>>>,
}

impl BackendHandle {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(backend)),
        }
    }

    /// The gateway to use for the next request.
    pub async fn current(&self) -> Arc<dyn Backend> {
        Arc::clone(&*self.inner.read().await)
    }

    pub async fn replace(&self, backend: Arc<dyn Backend>) {
        *self.inner.write().await = backend;
    }

    pub async fn base_url(&self) -> String {
        self.inner.read().await.base_url().to_string()
    }
}
