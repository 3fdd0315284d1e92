use std::path::PathBuf;

use crate::{
    channel::RequestSender,
    config::Config,
    error::{Result, ScanError},
    operation::Operation,
    request::Request,
    segment::{RequesterId, SegmentStore},
    wait::WaitPolicy,
};

/// Client side of the protocol.
#[derive(Clone, Debug)]
pub struct Requester {
    id: RequesterId,
    store: SegmentStore,
    channel_path: PathBuf,
    wait: WaitPolicy,
}

impl Requester {
    pub fn new(id: RequesterId, store: SegmentStore, channel_path: impl Into<PathBuf>, wait: WaitPolicy) -> Self {
        Self {
            id,
            store,
            channel_path: channel_path.into(),
            wait,
        }
    }

    /// Identified by the current process id.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            RequesterId::current_process(),
            SegmentStore::new(&config.segment_dir),
            &config.channel_path,
            config.wait.clone(),
        )
    }

    pub fn id(&self) -> RequesterId {
        self.id
    }

    /// Runs one full exchange and returns the scanned values.
    ///
    /// The segment is destroyed on every exit path, including errors.
    pub fn submit(&self, op: Operation, values: &[i32]) -> Result<Vec<i32>> {
        let request = Request::new(self.id, values.len(), op)?;
        if op == Operation::Gcd {
            if let Some(v) = values.iter().find(|v| **v < 0) {
                return Err(ScanError::input(format!("gcd needs non-negative values, got {v}")));
            }
        }

        let owner = self.store.create(self.id, values.len())?;
        owner.write_values(values)?;
        owner.publish_data()?;

        let mut sender = RequestSender::open(&self.channel_path)?;
        sender.send(&request)?;
        tracing::info!(requester = %self.id, %op, n = values.len(), "request sent");

        let result = owner.wait_for_result(&self.wait)?;
        owner.destroy()?;

        Ok(result)
    }
}
