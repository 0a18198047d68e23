//! Asynchronous match job dispatch.
//!
//! Connection handlers hand jobs to a worker pool and return immediately;
//! workers run the identify/enroll pipelines against the store and publish
//! results back through the session registry. Delivery is at-most-once and
//! best-effort, and there is no ordering guarantee across in-flight jobs.

use crate::audit::{AuditOperation, AuditRecord, AuditSink};
use crate::error::GateError;
use crate::face::{EmbeddingExtractor, ExtractOutcome};
use crate::session::{SessionId, SessionRegistry};
use crate::storage::VectorIndexStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum JobKind {
    Identify { image: Vec<u8> },
    Enroll { image: Vec<u8>, uid: String },
}

#[derive(Debug, Clone)]
pub struct MatchJob {
    pub id: Uuid,
    pub session: SessionId,
    pub credential: String,
    pub kind: JobKind,
    pub submitted_at: DateTime<Utc>,
}

impl MatchJob {
    pub fn new(session: &str, credential: &str, kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            session: session.to_string(),
            credential: credential.to_string(),
            kind,
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Found,
    NoMatch,
    Enrolled,
    NoFace,
    DecodeError,
    DuplicateUid,
    DuplicateFace,
    IndexUnavailable,
    InternalError,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub job_id: Uuid,
    pub session: SessionId,
    pub status: MatchStatus,
    pub message: String,
    pub uid: Option<String>,
}

impl MatchResult {
    fn new(job_id: Uuid, session: &str, status: MatchStatus, message: &str) -> Self {
        Self {
            job_id,
            session: session.to_string(),
            status,
            message: message.to_string(),
            uid: None,
        }
    }

    fn with_uid(mut self, uid: &str) -> Self {
        self.uid = Some(uid.to_string());
        self
    }
}

/// Shared collaborators for worker execution.
pub struct DispatchContext {
    pub extractor: Arc<dyn EmbeddingExtractor>,
    pub store: Arc<VectorIndexStore>,
    pub registry: Arc<SessionRegistry>,
    pub audit: Arc<dyn AuditSink>,
}

pub struct MatchDispatcher {
    queue: mpsc::Sender<MatchJob>,
    workers: Vec<JoinHandle<()>>,
}

impl MatchDispatcher {
    pub fn start(worker_count: usize, context: DispatchContext) -> Self {
        let (tx, rx) = mpsc::channel::<MatchJob>();
        let rx = Arc::new(Mutex::new(rx));
        let context = Arc::new(context);

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let context = Arc::clone(&context);
                std::thread::spawn(move || run_worker(worker, rx, context))
            })
            .collect();

        Self { queue: tx, workers }
    }

    /// Enqueues a job and returns its id for diagnostics. Never blocks on
    /// completion; there is no await contract.
    pub fn submit(&self, job: MatchJob) -> Uuid {
        let id = job.id;
        if self.queue.send(job).is_err() {
            tracing::warn!(job = %id, "Dispatcher queue closed; job dropped");
        }
        id
    }

    /// Closes the queue, drains remaining jobs, and joins the workers.
    pub fn shutdown(self) {
        drop(self.queue);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn run_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<MatchJob>>>,
    context: Arc<DispatchContext>,
) {
    loop {
        let next = {
            let queue = rx.lock().unwrap_or_else(PoisonError::into_inner);
            queue.recv()
        };
        let Ok(job) = next else {
            tracing::debug!(worker, "Worker exiting");
            break;
        };

        let job_id = job.id;
        let session = job.session.clone();
        tracing::debug!(worker, job = %job_id, session = %session, "Executing job");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            execute_job(&context, job)
        }))
        .unwrap_or_else(|_| {
            tracing::error!(job = %job_id, "Job panicked");
            MatchResult::new(job_id, &session, MatchStatus::InternalError, "Internal error")
        });

        if !context.registry.publish(result) {
            tracing::debug!(job = %job_id, session = %session, "Result dropped, session gone");
        }
    }
}

fn execute_job(context: &DispatchContext, job: MatchJob) -> MatchResult {
    match &job.kind {
        JobKind::Identify { image } => {
            execute_identify(context, job.id, &job.session, &job.credential, image)
        }
        JobKind::Enroll { image, uid } => {
            execute_enroll(context, job.id, &job.session, &job.credential, image, uid)
        }
    }
}

fn execute_identify(
    context: &DispatchContext,
    job_id: Uuid,
    session: &str,
    credential: &str,
    image: &[u8],
) -> MatchResult {
    let embedding = match context.extractor.extract(image) {
        ExtractOutcome::Embedding(embedding) => embedding,
        ExtractOutcome::NoFace => {
            return MatchResult::new(job_id, session, MatchStatus::NoFace, "Face not found")
        }
        ExtractOutcome::DecodeError(detail) => {
            tracing::debug!(job = %job_id, %detail, "Image decode failed");
            return MatchResult::new(
                job_id,
                session,
                MatchStatus::DecodeError,
                "Failed to decode image",
            );
        }
    };

    match context.store.search(&embedding) {
        Ok(Some((distance, uid))) => {
            tracing::info!(job = %job_id, %uid, distance, "Identify match");
            audit(context, credential, &uid, AuditOperation::Identify);
            MatchResult::new(job_id, session, MatchStatus::Found, "User found").with_uid(&uid)
        }
        Ok(None) => MatchResult::new(job_id, session, MatchStatus::NoMatch, "No match found"),
        Err(GateError::IndexUnavailable(detail)) => {
            tracing::warn!(job = %job_id, %detail, "Index unavailable during identify");
            MatchResult::new(
                job_id,
                session,
                MatchStatus::IndexUnavailable,
                "Index unavailable, try again later",
            )
        }
        Err(e) => {
            tracing::error!(job = %job_id, error = %e, "Identify failed");
            MatchResult::new(job_id, session, MatchStatus::InternalError, "Internal error")
        }
    }
}

fn execute_enroll(
    context: &DispatchContext,
    job_id: Uuid,
    session: &str,
    credential: &str,
    image: &[u8],
    uid: &str,
) -> MatchResult {
    // Cheap short-circuit before paying for extraction. The transaction
    // below re-checks under the write lock.
    match context.store.exists(uid) {
        Ok(true) => {
            return MatchResult::new(
                job_id,
                session,
                MatchStatus::DuplicateUid,
                "User with this uid already exists",
            )
            .with_uid(uid)
        }
        Ok(false) => {}
        Err(e) => return store_failure(job_id, session, e),
    }

    let embedding = match context.extractor.extract(image) {
        ExtractOutcome::Embedding(embedding) => embedding,
        ExtractOutcome::NoFace => {
            return MatchResult::new(job_id, session, MatchStatus::NoFace, "Face not found")
        }
        ExtractOutcome::DecodeError(detail) => {
            tracing::debug!(job = %job_id, %detail, "Image decode failed");
            return MatchResult::new(
                job_id,
                session,
                MatchStatus::DecodeError,
                "Failed to decode image",
            );
        }
    };

    let mut txn = match context.store.begin_write() {
        Ok(txn) => txn,
        Err(e) => return store_failure(job_id, session, e),
    };

    if txn.exists(uid) {
        return MatchResult::new(
            job_id,
            session,
            MatchStatus::DuplicateUid,
            "User with this uid already exists",
        )
        .with_uid(uid);
    }

    if let Some((distance, existing)) = txn.search(&embedding) {
        tracing::info!(job = %job_id, %existing, distance, "Face already enrolled");
        return MatchResult::new(
            job_id,
            session,
            MatchStatus::DuplicateFace,
            &format!("Face already enrolled under uid {}", existing),
        )
        .with_uid(&existing);
    }

    if let Err(e) = txn.add(embedding, uid.to_string()) {
        tracing::error!(job = %job_id, error = %e, "Enroll staging failed");
        return MatchResult::new(job_id, session, MatchStatus::InternalError, "Internal error");
    }
    if let Err(e) = txn.commit() {
        return store_failure(job_id, session, e);
    }

    tracing::info!(job = %job_id, %uid, "Enrolled");
    audit(context, credential, uid, AuditOperation::Enroll);
    MatchResult::new(job_id, session, MatchStatus::Enrolled, "Added to index").with_uid(uid)
}

fn store_failure(job_id: Uuid, session: &str, error: GateError) -> MatchResult {
    match error {
        GateError::IndexUnavailable(detail) => {
            tracing::warn!(job = %job_id, %detail, "Index unavailable during enroll");
            MatchResult::new(
                job_id,
                session,
                MatchStatus::IndexUnavailable,
                "Index unavailable, try again later",
            )
        }
        e => {
            tracing::error!(job = %job_id, error = %e, "Enroll failed");
            MatchResult::new(job_id, session, MatchStatus::InternalError, "Internal error")
        }
    }
}

fn audit(context: &DispatchContext, credential: &str, uid: &str, operation: AuditOperation) {
    let record = AuditRecord::new(credential, uid, operation);
    if let Err(e) = context.audit.record(&record) {
        tracing::warn!(error = %e, "Audit log failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopAuditSink;
    use crate::config::StoreConfig;
    use crate::face::Embedding;
    use std::path::Path;
    use std::time::Duration;

    /// Reads the first image byte as a coordinate; "bad" and "empty" select
    /// the failure outcomes.
    struct StubExtractor;

    impl EmbeddingExtractor for StubExtractor {
        fn extract(&self, image: &[u8]) -> ExtractOutcome {
            match image {
                b"bad" => ExtractOutcome::DecodeError("stub decode failure".to_string()),
                b"empty" => ExtractOutcome::NoFace,
                bytes => {
                    let mut v: Embedding = vec![0.0; 4];
                    v[0] = f32::from(bytes[0]);
                    ExtractOutcome::Embedding(v)
                }
            }
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    struct CollectingSink(Mutex<Vec<AuditRecord>>);

    impl AuditSink for CollectingSink {
        fn record(&self, record: &AuditRecord) -> crate::error::Result<()> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn record(&self, _record: &AuditRecord) -> crate::error::Result<()> {
            Err(GateError::Internal("sink down".to_string()))
        }
    }

    struct Harness {
        registry: Arc<SessionRegistry>,
        store: Arc<VectorIndexStore>,
        audit: Arc<CollectingSink>,
        dispatcher: MatchDispatcher,
    }

    fn harness(dir: &Path, workers: usize) -> Harness {
        let config = StoreConfig {
            index_path: dir.join("faces.index"),
            key_path: dir.join("store.key"),
            dimension: 4,
            match_threshold: 0.2,
            create_if_missing: true,
        };
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(VectorIndexStore::open(&config).unwrap());
        let audit = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let dispatcher = MatchDispatcher::start(
            workers,
            DispatchContext {
                extractor: Arc::new(StubExtractor),
                store: Arc::clone(&store),
                registry: Arc::clone(&registry),
                audit: Arc::clone(&audit) as Arc<dyn AuditSink>,
            },
        );
        Harness {
            registry,
            store,
            audit,
            dispatcher,
        }
    }

    fn recv(rx: &mpsc::Receiver<MatchResult>) -> MatchResult {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn identify_finds_enrolled_user() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 2);
        h.store
            .add(vec![vec![5.0, 0.0, 0.0, 0.0]], vec!["bob".to_string()])
            .unwrap();

        let (session, rx) = h.registry.open_session();
        h.dispatcher.submit(MatchJob::new(
            session.id(),
            "key-1",
            JobKind::Identify { image: vec![5] },
        ));

        let result = recv(&rx);
        assert_eq!(result.status, MatchStatus::Found);
        assert_eq!(result.message, "User found");
        assert_eq!(result.uid.as_deref(), Some("bob"));

        let records = h.audit.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, AuditOperation::Identify);
        assert_eq!(records[0].uid, "bob");
        assert_eq!(records[0].credential, "key-1");
    }

    #[test]
    fn identify_reports_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 1);
        h.store
            .add(vec![vec![5.0, 0.0, 0.0, 0.0]], vec!["bob".to_string()])
            .unwrap();

        let (session, rx) = h.registry.open_session();
        h.dispatcher.submit(MatchJob::new(
            session.id(),
            "key-1",
            JobKind::Identify { image: vec![9] },
        ));

        let result = recv(&rx);
        assert_eq!(result.status, MatchStatus::NoMatch);
        assert_eq!(result.message, "No match found");
        assert!(result.uid.is_none());
        assert!(h.audit.0.lock().unwrap().is_empty());
    }

    #[test]
    fn identify_maps_extraction_failures() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 1);
        let (session, rx) = h.registry.open_session();

        h.dispatcher.submit(MatchJob::new(
            session.id(),
            "key-1",
            JobKind::Identify {
                image: b"bad".to_vec(),
            },
        ));
        assert_eq!(recv(&rx).status, MatchStatus::DecodeError);

        h.dispatcher.submit(MatchJob::new(
            session.id(),
            "key-1",
            JobKind::Identify {
                image: b"empty".to_vec(),
            },
        ));
        let result = recv(&rx);
        assert_eq!(result.status, MatchStatus::NoFace);
        assert_eq!(result.message, "Face not found");
    }

    #[test]
    fn enroll_adds_then_rejects_duplicate_uid() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 1);
        let (session, rx) = h.registry.open_session();

        h.dispatcher.submit(MatchJob::new(
            session.id(),
            "key-1",
            JobKind::Enroll {
                image: vec![5],
                uid: "alice".to_string(),
            },
        ));
        let first = recv(&rx);
        assert_eq!(first.status, MatchStatus::Enrolled);
        assert_eq!(first.message, "Added to index");
        assert!(h.store.exists("alice").unwrap());

        // Distinct face, same uid.
        h.dispatcher.submit(MatchJob::new(
            session.id(),
            "key-1",
            JobKind::Enroll {
                image: vec![50],
                uid: "alice".to_string(),
            },
        ));
        let second = recv(&rx);
        assert_eq!(second.status, MatchStatus::DuplicateUid);
        assert_eq!(h.store.len().unwrap(), 1);
    }

    #[test]
    fn enroll_rejects_face_already_under_other_uid() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 1);
        let (session, rx) = h.registry.open_session();

        h.dispatcher.submit(MatchJob::new(
            session.id(),
            "key-1",
            JobKind::Enroll {
                image: vec![5],
                uid: "alice".to_string(),
            },
        ));
        assert_eq!(recv(&rx).status, MatchStatus::Enrolled);

        h.dispatcher.submit(MatchJob::new(
            session.id(),
            "key-1",
            JobKind::Enroll {
                image: vec![5],
                uid: "bob".to_string(),
            },
        ));
        let result = recv(&rx);
        assert_eq!(result.status, MatchStatus::DuplicateFace);
        assert_eq!(result.uid.as_deref(), Some("alice"));
        assert!(result.message.contains("alice"));
        assert!(!h.store.exists("bob").unwrap());
    }

    #[test]
    fn concurrent_enrolls_with_same_uid_admit_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 4);
        let (session, rx) = h.registry.open_session();

        for value in [10u8, 200u8] {
            h.dispatcher.submit(MatchJob::new(
                session.id(),
                "key-1",
                JobKind::Enroll {
                    image: vec![value],
                    uid: "alice".to_string(),
                },
            ));
        }

        let statuses = [recv(&rx).status, recv(&rx).status];
        assert!(statuses.contains(&MatchStatus::Enrolled));
        assert!(statuses.contains(&MatchStatus::DuplicateUid));
        assert_eq!(h.store.len().unwrap(), 1);
    }

    #[test]
    fn results_route_to_owning_session_only() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 2);
        h.store
            .add(vec![vec![5.0, 0.0, 0.0, 0.0]], vec!["bob".to_string()])
            .unwrap();

        let (session_a, rx_a) = h.registry.open_session();
        let (session_b, rx_b) = h.registry.open_session();

        let job_a = h.dispatcher.submit(MatchJob::new(
            session_a.id(),
            "key-1",
            JobKind::Identify { image: vec![5] },
        ));
        let job_b = h.dispatcher.submit(MatchJob::new(
            session_b.id(),
            "key-1",
            JobKind::Identify { image: vec![9] },
        ));

        let result_a = recv(&rx_a);
        let result_b = recv(&rx_b);
        assert_eq!(result_a.job_id, job_a);
        assert_eq!(result_a.session, session_a.id());
        assert_eq!(result_b.job_id, job_b);
        assert_eq!(result_b.session, session_b.id());
    }

    #[test]
    fn result_for_departed_session_drops_silently() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 1);
        let (session, rx) = h.registry.open_session();
        let id = session.id().to_string();
        h.registry.close_session(&id);
        drop(rx);
        drop(session);

        h.dispatcher.submit(MatchJob::new(
            &id,
            "key-1",
            JobKind::Enroll {
                image: vec![5],
                uid: "alice".to_string(),
            },
        ));

        // Drain the pool; the work itself still completed.
        h.dispatcher.shutdown();
        assert!(h.store.exists("alice").unwrap());
        assert_eq!(h.registry.active_sessions(), 0);
    }

    #[test]
    fn shutdown_drains_queued_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 1);
        let (session, rx) = h.registry.open_session();

        for value in [10u8, 20, 30, 40] {
            h.dispatcher.submit(MatchJob::new(
                session.id(),
                "key-1",
                JobKind::Enroll {
                    image: vec![value],
                    uid: format!("user-{}", value),
                },
            ));
        }
        h.dispatcher.shutdown();

        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 4);
        assert_eq!(h.store.len().unwrap(), 4);
    }

    #[test]
    fn audit_failure_does_not_change_result() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            index_path: dir.path().join("faces.index"),
            key_path: dir.path().join("store.key"),
            dimension: 4,
            match_threshold: 0.2,
            create_if_missing: true,
        };
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(VectorIndexStore::open(&config).unwrap());
        let dispatcher = MatchDispatcher::start(
            1,
            DispatchContext {
                extractor: Arc::new(StubExtractor),
                store: Arc::clone(&store),
                registry: Arc::clone(&registry),
                audit: Arc::new(FailingSink),
            },
        );

        let (session, rx) = registry.open_session();
        dispatcher.submit(MatchJob::new(
            session.id(),
            "key-1",
            JobKind::Enroll {
                image: vec![5],
                uid: "alice".to_string(),
            },
        ));
        assert_eq!(recv(&rx).status, MatchStatus::Enrolled);
        dispatcher.shutdown();
    }

    #[test]
    fn noop_sink_satisfies_the_trait() {
        let sink = NoopAuditSink;
        assert!(sink
            .record(&AuditRecord::new("k", "alice", AuditOperation::Enroll))
            .is_ok());
    }
}
