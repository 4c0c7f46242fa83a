//! Problem catalogue cache with periodic refresh.
//!
//! One writer (the refresh task), many readers. Readers take cheap
//! snapshots of the current list; a stale read during refresh is fine.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ops::{parse_json, OpError, OpResult};
use crate::registry::{JudgeCapability, Registry};

/// Interval between catalogue refreshes.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(120);

/// In-memory problem catalogue, shared process-wide.
pub struct ProblemCache {
    list: RwLock<Arc<Value>>,
}

impl ProblemCache {
    pub fn new() -> Self {
        ProblemCache {
            list: RwLock::new(Arc::new(Value::Array(Vec::new()))),
        }
    }

    /// The current catalogue snapshot.
    pub fn snapshot(&self) -> Arc<Value> {
        Arc::clone(&self.list.read().unwrap())
    }

    fn replace(&self, list: Value) {
        *self.list.write().unwrap() = Arc::new(list);
    }
}

impl Default for ProblemCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Ask an available judge server for its current problem catalogue and
/// replace the cached list with the answer. The request body is our
/// protocol version string.
pub async fn refresh_problem_list(registry: &Registry, cache: &ProblemCache) -> OpResult<()> {
    let server = registry
        .select_server(JudgeCapability::Submit)
        .ok_or(OpError::NoJudgeAvailable)?;
    let client = registry
        .judge_client(server, JudgeCapability::Submit)
        .ok_or(OpError::ServiceUnavailable("Judge"))?;
    if !client.is_connected() {
        return Err(OpError::ServiceUnavailable("Judge"));
    }

    let list = {
        let _lock = client.acquire_lock().await?;
        let resp = client.send_and_wait(b'V', registry.protocol_version()).await?;
        parse_json(&resp.body)?
    };

    cache.replace(list);
    debug!(server, "Problem list refreshed");
    Ok(())
}

/// Periodic refresh task; failures are logged and retried next tick.
pub fn spawn_refresh(
    registry: Arc<Registry>,
    cache: Arc<ProblemCache>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = refresh_problem_list(&registry, &cache).await {
                warn!(error = %e, "Problem list refresh failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::harness::{judge, registry_for};
    use crate::testutil::{send, ScriptedPeer};

    #[tokio::test]
    async fn test_refresh_replaces_cached_list() {
        let judge_peer =
            ScriptedPeer::spawn(vec![send(b'O', r#"[{"pid":"P1001","title":"A+B"}]"#)]).await;
        let registry = registry_for(
            None,
            None,
            vec![judge(1, Some(judge_peer.addr.port()), None, None)],
        )
        .await;
        let cache = ProblemCache::new();
        assert_eq!(*cache.snapshot(), Value::Array(Vec::new()));

        refresh_problem_list(&registry, &cache).await.unwrap();
        assert_eq!(cache.snapshot()[0]["pid"], "P1001");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_without_judges_keeps_old_list() {
        let registry = registry_for(None, None, vec![]).await;
        let cache = ProblemCache::new();

        let result = refresh_problem_list(&registry, &cache).await;
        assert!(matches!(result, Err(OpError::NoJudgeAvailable)));
        assert_eq!(*cache.snapshot(), Value::Array(Vec::new()));
    }

    #[tokio::test]
    async fn test_spawned_refresh_runs_periodically() {
        let judge_peer = ScriptedPeer::spawn(vec![
            send(b'O', r#"["P1"]"#),
            send(b'O', r#"["P1","P2"]"#),
        ])
        .await;
        let registry = registry_for(
            None,
            None,
            vec![judge(1, Some(judge_peer.addr.port()), None, None)],
        )
        .await;
        let cache = Arc::new(ProblemCache::new());

        let task = spawn_refresh(
            Arc::clone(&registry),
            Arc::clone(&cache),
            Duration::from_millis(100),
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
        task.abort();

        let snapshot = cache.snapshot();
        assert_eq!(snapshot[0], "P1");
        assert_eq!(snapshot[1], "P2");
        registry.shutdown().await;
    }
}
