use pool_reconcile::Reconciler;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub bearer_token: Arc<String>,
    pub environment_tag: Arc<String>,
}
