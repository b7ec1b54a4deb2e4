use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::MultiCache;

/// context hints attached to a cache lookup; drives related-key prefetch
#[derive(Clone, Debug, Default)]
pub struct CacheContext {
    /// path of the object being fetched, when known
    pub path: Option<String>,
    /// commit the lookup belongs to, when known
    pub commit: Option<String>,
    /// keys likely to be wanted next (sibling tree entries, same directory)
    pub related_keys: Vec<String>,
}

impl CacheContext {
    pub fn for_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_related(mut self, keys: Vec<String>) -> Self {
        self.related_keys = keys;
        self
    }
}

/// fetch related keys in the background, warming the hotter tiers
///
/// failures are silent and the task never blocks the foreground request.
pub(crate) fn spawn(cache: Arc<MultiCache>, keys: Vec<String>, cancel: CancellationToken) {
    if keys.is_empty() {
        return;
    }

    tokio::spawn(async move {
        for key in keys {
            if cancel.is_cancelled() {
                break;
            }
            if cache.memory_has(&key) {
                continue;
            }
            cache.record_prefetch_attempt();
            match cache.get(&key, &cancel).await {
                Ok(Some(_)) => cache.record_prefetch_success(),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(%key, error = %e, "prefetch failed");
                }
            }
        }
    });
}
