use std::collections::HashMap;
use std::sync::Mutex;

use common::storage::repository::SourceProgressSeed;
use common::storage::types::task::Stage;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct SourceProgress {
    pub total_chunks: usize,
    pub llm_running: usize,
    pub llm_succeeded: usize,
    pub llm_failed: usize,
    pub embed_running: usize,
    pub embed_succeeded: usize,
    pub embed_failed: usize,
    pub upsert_running: usize,
    pub upsert_succeeded: usize,
    pub upsert_failed: usize,
}

impl SourceProgress {
    fn is_complete(&self) -> bool {
        self.upsert_succeeded + self.llm_failed + self.embed_failed + self.upsert_failed
            >= self.total_chunks
    }

    fn has_activity(&self) -> bool {
        self.llm_running + self.embed_running + self.upsert_running > 0
    }
}

/// The only shared mutable in-process state: a `source_id -> counters` map guarded by a
/// single mutex, held only across short counter updates and line formatting.
pub struct ProgressMap {
    inner: Mutex<HashMap<String, SourceProgress>>,
}

impl ProgressMap {
    pub fn seeded(seed: HashMap<String, SourceProgressSeed>) -> Self {
        let inner = seed
            .into_iter()
            .map(|(source_id, s)| {
                (
                    source_id,
                    SourceProgress {
                        total_chunks: s.total_chunks,
                        llm_succeeded: s.llm_succeeded,
                        embed_succeeded: s.embed_succeeded,
                        upsert_succeeded: s.upsert_succeeded,
                        llm_failed: s.failed,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn mark_running(&self, source_id: &str, stage: Stage) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.lock().unwrap();
        let entry = guard.entry(source_id.to_string()).or_default();
        match stage {
            Stage::Llm => entry.llm_running += 1,
            Stage::Embed => entry.embed_running += 1,
            Stage::Upsert => entry.upsert_running += 1,
        }
    }

    pub fn mark_succeeded(&self, source_id: &str, stage: Stage) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.lock().unwrap();
        let entry = guard.entry(source_id.to_string()).or_default();
        match stage {
            Stage::Llm => {
                entry.llm_running = entry.llm_running.saturating_sub(1);
                entry.llm_succeeded += 1;
            }
            Stage::Embed => {
                entry.embed_running = entry.embed_running.saturating_sub(1);
                entry.embed_succeeded += 1;
            }
            Stage::Upsert => {
                entry.upsert_running = entry.upsert_running.saturating_sub(1);
                entry.upsert_succeeded += 1;
            }
        }
    }

    pub fn mark_failed(&self, source_id: &str, stage: Stage) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.lock().unwrap();
        let entry = guard.entry(source_id.to_string()).or_default();
        match stage {
            Stage::Llm => {
                entry.llm_running = entry.llm_running.saturating_sub(1);
                entry.llm_failed += 1;
            }
            Stage::Embed => {
                entry.embed_running = entry.embed_running.saturating_sub(1);
                entry.embed_failed += 1;
            }
            Stage::Upsert => {
                entry.upsert_running = entry.upsert_running.saturating_sub(1);
                entry.upsert_failed += 1;
            }
        }
    }

    /// Emits one summary line per source with activity and not yet complete.
    pub fn log_heartbeat(&self, run_id: &str) {
        #[allow(clippy::unwrap_used)]
        let guard = self.inner.lock().unwrap();
        for (source_id, progress) in guard.iter() {
            if progress.has_activity() && !progress.is_complete() {
                info!(
                    event = "progress_heartbeat",
                    run_id,
                    source_id,
                    total_chunks = progress.total_chunks,
                    llm_running = progress.llm_running,
                    llm_succeeded = progress.llm_succeeded,
                    embed_running = progress.embed_running,
                    embed_succeeded = progress.embed_succeeded,
                    upsert_running = progress.upsert_running,
                    upsert_succeeded = progress.upsert_succeeded,
                    "stage progress"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_running_then_succeeded_nets_to_zero_running() {
        let map = ProgressMap::seeded(HashMap::new());
        map.mark_running("src-1", Stage::Llm);
        map.mark_succeeded("src-1", Stage::Llm);

        #[allow(clippy::unwrap_used)]
        let guard = map.inner.lock().unwrap();
        let entry = guard.get("src-1").expect("entry exists");
        assert_eq!(entry.llm_running, 0);
        assert_eq!(entry.llm_succeeded, 1);
    }
}
