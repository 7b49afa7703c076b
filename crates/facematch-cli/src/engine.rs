use facematch_core::{
    CancelFlag, DetectionCandidate, FaceError, FacePipeline, NewIdentity, Recognition, RecognizeOptions, Registration,
};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker pool exited")]
    ChannelClosed,
}

/// Work accepted by the pool. Images are encoded bytes.
pub enum Job {
    Register { image: Vec<u8>, identity: NewIdentity },
    Recognize { image: Vec<u8>, options: RecognizeOptions },
    Detect { image: Vec<u8> },
}

pub enum JobOutput {
    Registered(Registration),
    Recognized(Recognition),
    Detected(Vec<DetectionCandidate>),
}

/// Executes a single job on a worker thread.
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, job: Job, cancel: &CancelFlag) -> Result<JobOutput, FaceError>;
}

impl JobRunner for FacePipeline {
    fn run(&self, job: Job, cancel: &CancelFlag) -> Result<JobOutput, FaceError> {
        match job {
            Job::Register { image, identity } => self.register(&image, identity, cancel).map(JobOutput::Registered),
            Job::Recognize { image, options } => self.recognize(&image, options, cancel).map(JobOutput::Recognized),
            Job::Detect { image } => self.detect_bytes(&image, cancel).map(JobOutput::Detected),
        }
    }
}

struct EngineRequest {
    job: Job,
    reply: oneshot::Sender<Result<JobOutput, FaceError>>,
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

/// Reply slot for a submitted job.
pub struct Pending {
    rx: oneshot::Receiver<Result<JobOutput, FaceError>>,
}

impl Pending {
    /// Block until the job's worker replies.
    pub fn wait(self) -> Result<JobOutput, EngineError> {
        Ok(self.rx.blocking_recv().map_err(|_| EngineError::ChannelClosed)??)
    }
}

impl EngineHandle {
    /// Queue a job, blocking while the queue is full.
    pub fn submit(&self, job: Job) -> Result<Pending, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .blocking_send(EngineRequest { job, reply })
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(Pending { rx })
    }

    /// Queue a job and wait for its result.
    pub fn run(&self, job: Job) -> Result<JobOutput, EngineError> {
        self.submit(job)?.wait()
    }
}

/// Spawn `workers` OS threads sharing one bounded request queue.
///
/// Workers exit once every [`EngineHandle`] is dropped and the queue drains.
/// Jobs still queued after `cancel` trips are answered with `Cancelled`.
pub fn spawn_engine<R: JobRunner>(
    runner: Arc<R>,
    workers: usize,
    queue_capacity: usize,
    cancel: CancelFlag,
) -> Result<(EngineHandle, Vec<JoinHandle<()>>), EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(queue_capacity.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let mut threads = Vec::with_capacity(workers);
    for id in 0..workers.max(1) {
        let runner = Arc::clone(&runner);
        let rx = Arc::clone(&rx);
        let cancel = cancel.clone();
        let thread = std::thread::Builder::new()
            .name(format!("facematch-worker-{id}"))
            .spawn(move || {
                tracing::debug!(worker = id, "worker started");
                loop {
                    // Hold the lock only while waiting, not while working
                    let next = match rx.lock() {
                        Ok(mut guard) => guard.blocking_recv(),
                        Err(_) => None,
                    };
                    let Some(EngineRequest { job, reply }) = next else {
                        break;
                    };
                    let result = match cancel.check() {
                        Ok(()) => runner.run(job, &cancel),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = &result {
                        tracing::debug!(worker = id, error = %e, "job failed");
                    }
                    let _ = reply.send(result);
                }
                tracing::debug!(worker = id, "worker exiting");
            })
            .map_err(EngineError::Spawn)?;
        threads.push(thread);
    }

    tracing::info!(workers = threads.len(), queue_capacity, "worker pool started");
    Ok((EngineHandle { tx }, threads))
}
