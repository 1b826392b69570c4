use std::sync::Arc;

use tokio::sync::RwLock;

use crate::metrics::{Diagnostics, Metrics};

/// Shared state handed to every reconcile invocation.
pub struct Context {
    pub client: kube::Client,
    pub metrics: Metrics,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}
