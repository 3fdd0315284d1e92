//! Server side: read requests off the channel and fan them out to compute tasks.
//!
//! ```text
//!   FIFO ──► reader task ──flume──► dispatch loop ──spawn_blocking──► worker::serve
//!                                        ▲                                 │
//!                                        └──────────── join_next ◄─────────┘
//! ```
//!
//! The loop never waits for a particular task. Every iteration selects over
//! the next request and the next finished task, so each task is reaped as
//! soon as it is done.

use std::{future::Future, sync::Arc};

use tokio::task::{JoinError, JoinSet};

use crate::{
    channel::{create_channel, RequestReceiver},
    config::{Backend, Config},
    engine::Engine,
    error::{Result, ScanError},
    prefix_scan::{ScanOutput, Scanner},
    request::Request,
    segment::SegmentStore,
    worker,
};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Well-formed requests handed to a compute task.
    pub received: u64,
    /// Malformed records dropped at the channel.
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
}

type TaskOutcome = (Request, Result<ScanOutput>);

pub struct Dispatcher {
    store: Arc<SegmentStore>,
    scanner: Arc<dyn Scanner>,
    max_in_flight: usize,
}

impl Dispatcher {
    pub fn new(store: SegmentStore, scanner: Arc<dyn Scanner>, max_in_flight: usize) -> Self {
        Self {
            store: Arc::new(store),
            scanner,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Builds the backend named by `config.backend`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let scanner: Arc<dyn Scanner> = match config.backend {
            Backend::Cpu => Arc::new(Engine::new(config.workers)?),
            #[cfg(feature = "gpu")]
            Backend::Gpu => Arc::new(crate::gpu::GpuEngine::new().await.map_err(crate::gpu::resource_error)?),
        };

        Ok(Self::new(
            SegmentStore::new(&config.segment_dir),
            scanner,
            config.max_in_flight,
        ))
    }

    /// Serves requests until `shutdown` resolves or the channel fails, then
    /// serves whatever was already read and waits for the tasks still running.
    pub async fn run(&self, receiver: RequestReceiver, shutdown: impl Future<Output = ()>) -> Result<DispatchStats> {
        // Unbounded, so the reader is only ever suspended inside `receive`.
        // Aborting it there cannot lose a record it already took off the FIFO.
        let (tx, rx) = flume::unbounded::<Result<Request>>();

        let reader = tokio::spawn(async move {
            let mut receiver = receiver;
            loop {
                let item = receiver.receive().await;
                let fatal = matches!(item, Err(ScanError::Resource { .. }));
                if tx.send(item).is_err() || fatal {
                    break;
                }
            }
        });

        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut stats = DispatchStats::default();
        let mut fatal = None;

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::info!(in_flight = tasks.len(), "shutdown requested");
                    break;
                }

                Some(joined) = tasks.join_next() => reap(joined, &mut stats),

                item = rx.recv_async(), if tasks.len() < self.max_in_flight => match item {
                    Ok(Ok(request)) => {
                        stats.received += 1;
                        self.spawn(&mut tasks, request);
                    }
                    Ok(Err(ScanError::Input(reason))) => {
                        stats.rejected += 1;
                        tracing::warn!(%reason, "dropping malformed request");
                    }
                    Ok(Err(err)) => {
                        tracing::error!(%err, "request channel failed");
                        fatal = Some(err);
                        break;
                    }
                    Err(_) => break,
                },
            }
        }

        reader.abort();
        let _ = reader.await;

        for item in rx.try_iter() {
            match item {
                Ok(request) => {
                    stats.received += 1;
                    tracing::warn!(requester = %request.requester_id, "serving request read before shutdown");
                    self.spawn(&mut tasks, request);
                }
                Err(ScanError::Input(reason)) => {
                    stats.rejected += 1;
                    tracing::warn!(%reason, "dropping malformed request");
                }
                Err(err) => tracing::error!(%err, "request channel failed"),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            reap(joined, &mut stats);
        }

        tracing::info!(?stats, "dispatcher stopped");

        match fatal {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    fn spawn(&self, tasks: &mut JoinSet<TaskOutcome>, request: Request) {
        tracing::info!(
            requester = %request.requester_id,
            op = %request.operation,
            n = request.element_count,
            "request received"
        );

        let store = self.store.clone();
        let scanner = self.scanner.clone();
        tasks.spawn_blocking(move || (request, worker::serve(&store, scanner.as_ref(), request)));
    }
}

fn reap(joined: std::result::Result<TaskOutcome, JoinError>, stats: &mut DispatchStats) {
    match joined {
        Ok((_, Ok(_))) => stats.completed += 1,
        Ok((request, Err(err))) => {
            stats.failed += 1;
            tracing::error!(requester = %request.requester_id, %err, "compute task failed");
        }
        Err(err) => {
            stats.failed += 1;
            tracing::error!(%err, "compute task panicked");
        }
    }
}

/// Creates the channel, serves until `shutdown`, then removes the channel.
pub async fn run_server(config: &Config, shutdown: impl Future<Output = ()>) -> Result<DispatchStats> {
    create_channel(&config.channel_path)?;
    let receiver = RequestReceiver::open(&config.channel_path)?;
    let dispatcher = match Dispatcher::from_config(config).await {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            let _ = std::fs::remove_file(&config.channel_path);
            return Err(err);
        }
    };

    tracing::info!(
        channel = %config.channel_path.display(),
        segments = %config.segment_dir.display(),
        backend = ?config.backend,
        workers = config.workers,
        "server ready"
    );

    let stats = dispatcher.run(receiver, shutdown).await;

    if let Err(err) = std::fs::remove_file(&config.channel_path) {
        tracing::warn!(%err, "could not remove request channel");
    }

    stats
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::PathBuf, time::Duration};

    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        channel::RequestSender,
        engine::Stage,
        operation::Operation,
        request::RequestRecord,
        requester::Requester,
        segment::{RequesterId, SegmentOwner, Status},
        wait::WaitPolicy,
    };

    struct Harness {
        _dir: tempfile::TempDir,
        channel: PathBuf,
        store: SegmentStore,
        stop: oneshot::Sender<()>,
        server: tokio::task::JoinHandle<Result<DispatchStats>>,
    }

    impl Harness {
        fn start(max_in_flight: usize) -> anyhow::Result<Self> {
            Self::start_with(Arc::new(Engine::new(3)?), max_in_flight)
        }

        fn start_with(scanner: Arc<dyn Scanner>, max_in_flight: usize) -> anyhow::Result<Self> {
            let dir = tempfile::tempdir()?;
            let channel = dir.path().join("fifo");
            let store = SegmentStore::new(dir.path());

            create_channel(&channel)?;
            let receiver = RequestReceiver::open(&channel)?;
            let dispatcher = Dispatcher::new(store.clone(), scanner, max_in_flight);

            let (stop, stopped) = oneshot::channel::<()>();
            let server = tokio::spawn(async move {
                dispatcher
                    .run(receiver, async {
                        let _ = stopped.await;
                    })
                    .await
            });

            Ok(Self {
                _dir: dir,
                channel,
                store,
                stop,
                server,
            })
        }

        fn requester(&self, id: i32) -> Requester {
            Requester::new(
                RequesterId(id),
                self.store.clone(),
                &self.channel,
                WaitPolicy::default().with_deadline(Duration::from_secs(10)),
            )
        }

        async fn stop(self) -> anyhow::Result<DispatchStats> {
            let _ = self.stop.send(());
            Ok(self.server.await??)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_requesters_get_their_own_results() -> anyhow::Result<()> {
        let harness = Harness::start(4)?;

        let mut clients = Vec::new();
        for id in 1..=12 {
            let requester = harness.requester(id);
            clients.push(tokio::task::spawn_blocking(move || {
                let op = Operation::ALL[id as usize % 6];
                let input: Vec<i32> = (0..id * 20).map(|v| v % 17 + 1).collect();
                let output = requester.submit(op, &input);
                (op, input, output)
            }));
        }

        for client in futures::future::join_all(clients).await {
            let (op, input, output) = client?;
            let output = output?;
            if op.is_associative() {
                assert_eq!(output, op.fold_prefixes(&input), "{op}");
            } else {
                assert_eq!(output.len(), input.len());
            }
        }

        let stats = harness.stop().await?;
        assert_eq!(stats.received, 12);
        assert_eq!(stats.completed, 12);
        assert_eq!(stats.failed, 0);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_segment_does_not_stop_the_dispatcher() -> anyhow::Result<()> {
        let harness = Harness::start(2)?;

        let channel = harness.channel.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut sender = RequestSender::open(&channel)?;
            sender.send(&Request::new(RequesterId(999), 3, Operation::Add)?)
        })
        .await??;

        let requester = harness.requester(5);
        let result = tokio::task::spawn_blocking(move || requester.submit(Operation::Add, &[1, 2, 3, 4, 5])).await??;
        assert_eq!(result, vec![1, 3, 6, 10, 15]);

        let stats = harness.stop().await?;
        assert_eq!(stats.received, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_records_are_counted_and_skipped() -> anyhow::Result<()> {
        let harness = Harness::start(2)?;

        let channel = harness.channel.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut fifo = std::fs::OpenOptions::new().write(true).open(&channel)?;
            let bad = RequestRecord {
                requester_id: 1,
                element_count: 0,
                operation: 1,
            };
            fifo.write_all(bad.as_bytes())?;
            Ok(())
        })
        .await??;

        let requester = harness.requester(6);
        let result = tokio::task::spawn_blocking(move || requester.submit(Operation::Gcd, &[12, 18, 24])).await??;
        assert_eq!(result, vec![12, 6, 6]);

        let stats = harness.stop().await?;
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.completed, 1);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn observed_status_is_monotonic() -> anyhow::Result<()> {
        let harness = Harness::start(1)?;
        let store = harness.store.clone();
        let channel = harness.channel.clone();

        let (observed, result) = tokio::task::spawn_blocking(move || -> Result<(Vec<Status>, Vec<i32>)> {
            let id = RequesterId(31);
            let input: Vec<i32> = (1..=200).collect();
            let owner = store.create(id, input.len())?;
            let mut observed = vec![owner.status()?];

            owner.write_values(&input)?;
            owner.publish_data()?;
            RequestSender::open(&channel)?.send(&Request::new(id, input.len(), Operation::Max)?)?;

            loop {
                let status = owner.status()?;
                if observed.last() != Some(&status) {
                    observed.push(status);
                }
                if status == Status::ResultReady {
                    break;
                }
                std::thread::yield_now();
            }

            let result = owner.read_values()?;
            owner.destroy()?;
            Ok((observed, result))
        })
        .await??;

        assert!(observed.windows(2).all(|w| w[0] < w[1]), "{observed:?}");
        assert_eq!(observed.first(), Some(&Status::AwaitingData));
        assert_eq!(observed.last(), Some(&Status::ResultReady));
        assert_eq!(result, (1..=200).collect::<Vec<i32>>());

        harness.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requests_read_before_shutdown_are_still_served() -> anyhow::Result<()> {
        let slow = Engine::new(2)?.with_index_hook(Arc::new(|_: Stage, _: usize| {
            std::thread::sleep(Duration::from_millis(300));
        }));
        let harness = Harness::start_with(Arc::new(slow), 1)?;
        let store = harness.store.clone();
        let channel = harness.channel.clone();

        let owners = tokio::task::spawn_blocking(move || -> Result<Vec<SegmentOwner>> {
            let mut sender = RequestSender::open(&channel)?;
            let mut owners = Vec::new();
            for id in [41, 42] {
                let id = RequesterId(id);
                let owner = store.create(id, 2)?;
                owner.write_values(&[1, 2])?;
                owner.publish_data()?;
                sender.send(&Request::new(id, 2, Operation::Add)?)?;
                owners.push(owner);
            }
            Ok(owners)
        })
        .await??;

        // The first scan is still running and the second request is queued.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = harness.stop().await?;

        assert_eq!(stats.received, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 0);
        for owner in &owners {
            assert_eq!(owner.status()?, Status::ResultReady);
            assert_eq!(owner.read_values()?, vec![1, 3]);
        }

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leftover_segment_does_not_block_the_requester() -> anyhow::Result<()> {
        let harness = Harness::start(2)?;
        std::mem::forget(harness.store.create(RequesterId(4242), 3)?);

        let requester = harness.requester(4242);
        let result = tokio::task::spawn_blocking(move || requester.submit(Operation::Add, &[1, 2, 3])).await??;
        assert_eq!(result, vec![1, 3, 6]);
        assert!(!harness.store.path_for(RequesterId(4242)).exists());

        let stats = harness.stop().await?;
        assert_eq!(stats.completed, 1);

        Ok(())
    }

    #[tokio::test]
    async fn run_server_creates_and_removes_channel() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config {
            channel_path: dir.path().join("fifo"),
            segment_dir: dir.path().to_owned(),
            workers: 2,
            ..Config::default()
        };

        let stats = run_server(&config, async {}).await?;
        assert_eq!(stats, DispatchStats::default());
        assert!(!config.channel_path.exists());

        Ok(())
    }
}
