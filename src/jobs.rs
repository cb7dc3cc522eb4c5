use crate::{
    models::{ApiError, SyncRequest},
    pipeline::Pipeline,
};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use uuid::Uuid;

/// Background sync queue. A single worker drains it, so two runs can never
/// interleave their stages against the same listing.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<StatusBoard>>,
}

#[derive(Clone)]
struct Job {
    id: Uuid,
    request: SyncRequest,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        result: crate::models::SyncResponse,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

impl JobState {
    fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed { .. } | JobState::Failed { .. })
    }
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

/// Status map with bounded retention: terminal records are evicted oldest
/// first once more than `cap` of them have accumulated, so a long-lived
/// worker does not grow without limit. In-flight jobs are never evicted.
struct StatusBoard {
    entries: HashMap<Uuid, JobState>,
    finished: VecDeque<Uuid>,
    cap: usize,
}

impl StatusBoard {
    fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            finished: VecDeque::new(),
            cap,
        }
    }

    fn set(&mut self, id: Uuid, state: JobState) {
        let terminal = state.is_terminal();
        self.entries.insert(id, state);
        if terminal {
            self.finished.push_back(id);
            while self.finished.len() > self.cap {
                if let Some(evicted) = self.finished.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    fn get(&self, id: Uuid) -> Option<JobState> {
        self.entries.get(&id).cloned()
    }
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses = Arc::new(Mutex::new(StatusBoard::new(status_retention_from_env())));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.set(job.id, JobState::Running);
                }

                let result = pipeline.run(job.request).await;
                let mut guard = statuses_bg.lock().await;
                match result {
                    Ok(resp) => {
                        guard.set(job.id, JobState::Completed { result: resp });
                    }
                    Err(err) => {
                        guard.set(
                            job.id,
                            JobState::Failed {
                                error: err.detail().to_string(),
                                stage: Some(err.stage().to_string()),
                            },
                        );
                    }
                }
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_sync(&self, request: SyncRequest) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.set(id, JobState::Queued);
        }
        let job = Job { id, request };
        self.tx.send(job).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("worker not available".into()),
        })?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(id).map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

fn status_retention_from_env() -> usize {
    std::env::var("JOB_STATUS_RETENTION")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> JobState {
        JobState::Failed {
            error: "boom".to_string(),
            stage: Some("price".to_string()),
        }
    }

    #[test]
    fn terminal_records_are_evicted_oldest_first() {
        let mut board = StatusBoard::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        board.set(a, failed());
        board.set(b, failed());
        board.set(c, failed());

        assert!(board.get(a).is_none());
        assert!(board.get(b).is_some());
        assert!(board.get(c).is_some());
        assert_eq!(board.entries.len(), 2);
    }

    #[test]
    fn in_flight_jobs_survive_eviction_pressure() {
        let mut board = StatusBoard::new(1);
        let running = Uuid::new_v4();
        board.set(running, JobState::Running);
        for _ in 0..5 {
            board.set(Uuid::new_v4(), failed());
        }

        assert!(matches!(board.get(running), Some(JobState::Running)));
        // the running entry plus the single retained terminal record
        assert_eq!(board.entries.len(), 2);
    }
}
