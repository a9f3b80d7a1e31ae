use crate::config::WorkerConfig;
use crate::services::store::RawMessageStore;
use crate::workers::holdings_extractor::HoldingsExtractor;
use crate::workers::transaction_extractor::TransactionExtractor;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub raw_message_id: Uuid,
}

/// Producer side of the extraction queue. Never blocks.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: Option<mpsc::Sender<ExtractionJob>>,
}

impl DispatchHandle {
    /// A handle that accepts nothing; admitted messages wait for the sweeper.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Returns false when the job could not be queued.
    pub fn dispatch(&self, raw_message_id: Uuid) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(ExtractionJob { raw_message_id }) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(raw_message_id = %raw_message_id, error = %e, "Failed to queue extraction job");
                false
            }
        }
    }
}

/// Both extractors for one raw message.
pub struct ExtractionPipeline {
    raw_messages: Arc<dyn RawMessageStore>,
    transactions: Arc<TransactionExtractor>,
    holdings: Arc<HoldingsExtractor>,
}

impl ExtractionPipeline {
    pub fn new(
        raw_messages: Arc<dyn RawMessageStore>,
        transactions: Arc<TransactionExtractor>,
        holdings: Arc<HoldingsExtractor>,
    ) -> Self {
        Self {
            raw_messages,
            transactions,
            holdings,
        }
    }

    pub fn transactions(&self) -> Arc<TransactionExtractor> {
        self.transactions.clone()
    }

    pub async fn run(&self, raw_message_id: Uuid) {
        let message = match self.raw_messages.find_by_id(raw_message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::warn!(raw_message_id = %raw_message_id, "Queued message no longer exists");
                return;
            }
            Err(e) => {
                tracing::error!(raw_message_id = %raw_message_id, error = %e, "Failed to load queued message");
                return;
            }
        };

        let (transaction, _entries) = tokio::join!(
            self.transactions.extract_one(&message),
            self.holdings.extract(&message)
        );

        if let Err(e) = transaction {
            tracing::error!(
                raw_message_id = %raw_message_id,
                error = %e,
                "Transaction extraction failed, left for the backlog sweeper"
            );
        }
    }
}

/// Fixed pool of extraction workers fed from a bounded queue.
pub struct ExtractionDispatcher {
    config: WorkerConfig,
    pipeline: Arc<ExtractionPipeline>,
    job_rx: Option<mpsc::Receiver<ExtractionJob>>,
    shutdown_token: CancellationToken,
}

impl ExtractionDispatcher {
    pub fn new(
        config: WorkerConfig,
        pipeline: Arc<ExtractionPipeline>,
        shutdown_token: CancellationToken,
    ) -> (Self, DispatchHandle) {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size.max(1));

        let dispatcher = Self {
            config,
            pipeline,
            job_rx: Some(job_rx),
            shutdown_token,
        };

        (dispatcher, DispatchHandle { tx: Some(job_tx) })
    }

    pub async fn start(mut self) {
        let Some(mut job_rx) = self.job_rx.take() else {
            tracing::warn!("Extraction dispatcher already started");
            return;
        };

        let worker_count = self.config.worker_count.max(1);
        tracing::info!(worker_count, "Starting extraction workers");

        let workers: Vec<Worker> = (0..worker_count)
            .map(|id| Worker {
                id,
                pipeline: self.pipeline.clone(),
            })
            .collect();
        let permits = Arc::new(Semaphore::new(worker_count));
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            let mut next_worker = 0;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Job distributor shutting down");
                        break;
                    }
                    job = job_rx.recv() => {
                        let Some(job) = job else {
                            tracing::info!("Channel closed, job distributor exiting");
                            break;
                        };

                        let worker = workers[next_worker].clone();
                        next_worker = (next_worker + 1) % workers.len();

                        let Ok(permit) = permits.clone().acquire_owned().await else {
                            break;
                        };

                        tracing::debug!(
                            worker_id = worker.id,
                            raw_message_id = %job.raw_message_id,
                            "Dispatching job to worker"
                        );

                        tokio::spawn(async move {
                            worker.process_job(job).await;
                            drop(permit);
                        });
                    }
                }
            }
        });
    }
}

#[derive(Clone)]
struct Worker {
    id: usize,
    pipeline: Arc<ExtractionPipeline>,
}

impl Worker {
    async fn process_job(&self, job: ExtractionJob) {
        let start = Instant::now();
        self.pipeline.run(job.raw_message_id).await;
        tracing::debug!(
            worker_id = self.id,
            raw_message_id = %job.raw_message_id,
            duration_ms = start.elapsed().as_millis() as u64,
            "Extraction job finished"
        );
    }
}
