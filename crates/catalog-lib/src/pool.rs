use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use drover_types::{UploadOutcome, UploadResult};
use log::{debug, error};
use tokio::task::JoinHandle;

use crate::client::CatalogApi;

/// One unit of work: the block name plus its pre-serialized payload.
#[derive(Debug, Clone)]
pub struct Submission {
  pub name: String,
  pub payload: Vec<u8>,
}

// sentinel protocol on the submission queue
enum PoolInput {
  Block(Submission),
  Stop,
}

const QUEUE_CAPACITY: usize = 1024;
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed set of long-lived upload workers. One submission queue feeds all
/// workers, one completion queue gathers their outcomes. Workers never
/// touch shared state: each owns a private catalog client.
pub struct UploadPool {
  input: flume::Sender<PoolInput>,
  results: flume::Receiver<UploadResult>,
  handles: Vec<JoinHandle<()>>,
}

impl UploadPool {
  /// Start n workers, each with its own client from the factory.
  pub fn start<F>(n: usize, factory: F) -> UploadPool
  where
    F: Fn() -> Arc<dyn CatalogApi>,
  {
    let (input_tx, input_rx) = flume::bounded(QUEUE_CAPACITY);
    let (result_tx, result_rx) = flume::bounded(QUEUE_CAPACITY);

    let mut handles = Vec::with_capacity(n);
    for worker_id in 0..n {
      let api = factory();
      let input = input_rx.clone();
      let results = result_tx.clone();
      handles.push(tokio::spawn(upload_worker(worker_id, api, input, results)));
    }

    UploadPool { input: input_tx, results: result_rx, handles }
  }

  pub fn size(&self) -> usize {
    self.handles.len()
  }

  pub async fn submit(&self, submission: Submission) -> Result<()> {
    self.input
      .send_async(PoolInput::Block(submission))
      .await
      .map_err(|_| anyhow!("upload pool submission queue is closed"))
  }

  /// One timed receive on the completion queue. None means no result
  /// arrived within the timeout (or every worker is gone).
  pub async fn recv_result(&self, timeout: Duration) -> Option<UploadResult> {
    match tokio::time::timeout(timeout, self.results.recv_async()).await {
      Ok(Ok(result)) => Some(result),
      Ok(Err(_)) => None,
      Err(_) => None,
    }
  }

  /// Tear the pool down: one Stop per worker, then join each. A worker
  /// that refuses to join within the timeout is aborted. The caller must
  /// not submit while this runs; consuming self enforces that.
  pub async fn close(self) {
    for _ in &self.handles {
      if self.input.send_async(PoolInput::Stop).await.is_err() {
        // workers already gone, nothing left to stop
        break;
      }
    }
    for handle in self.handles {
      let abort = handle.abort_handle();
      if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
        error!(target: "POOL", "worker refused to join; terminating it");
        abort.abort();
      }
    }
  }
}

async fn upload_worker(
  worker_id: usize,
  api: Arc<dyn CatalogApi>,
  input: flume::Receiver<PoolInput>,
  results: flume::Sender<UploadResult>,
) {
  debug!(target: "POOL", "worker {} waiting for blocks", worker_id);
  loop {
    let work = match input.recv_async().await {
      Ok(work) => work,
      Err(_) => {
        // queue dropped from under us; assume a graceful break attempt
        debug!(target: "POOL", "worker {} lost its submission queue", worker_id);
        break;
      }
    };
    let submission = match work {
      PoolInput::Stop => break,
      PoolInput::Block(submission) => submission,
    };

    let outcome = classify_upload(&*api, &submission).await;
    let result = UploadResult { name: submission.name, outcome };
    if results.send_async(result).await.is_err() {
      break;
    }
  }
  debug!(target: "POOL", "worker {} stopped", worker_id);
}

/// Exactly one outcome per submission. A duplicate insert counts as
/// success: the catalog answering "Block <name> already exists" is the
/// at-least-once reconciliation hook. A proxy-level error is ambiguous and
/// defers to the next cycle's existence probe.
async fn classify_upload(api: &dyn CatalogApi, submission: &Submission) -> UploadOutcome {
  match api.insert_bulk_block(&submission.payload).await {
    Ok(()) => UploadOutcome::Uploaded,
    Err(err) => {
      let message = format!("{:#}", err);
      if message.contains(&format!("Block {} already exists", submission.name)) {
        debug!(target: "POOL", "duplicate entry for block {}; treating as uploaded", submission.name);
        UploadOutcome::Uploaded
      } else if message.contains("Proxy Error") {
        error!(target: "POOL", "proxy error for block {}; will check next cycle", submission.name);
        UploadOutcome::Check
      } else {
        error!(target: "POOL", "error uploading block {}: {}", submission.name, message);
        UploadOutcome::Error(message)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::BlockListing;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicUsize, Ordering};

  enum Behavior {
    Accept,
    AlreadyExists,
    Proxy,
    Reject,
  }

  struct ScriptedCatalog {
    behavior: Behavior,
    block_name: String,
    calls: AtomicUsize,
  }

  impl ScriptedCatalog {
    fn new(behavior: Behavior, block_name: &str) -> Arc<Self> {
      Arc::new(ScriptedCatalog {
        behavior,
        block_name: block_name.to_string(),
        calls: AtomicUsize::new(0),
      })
    }
  }

  #[async_trait]
  impl CatalogApi for ScriptedCatalog {
    async fn insert_bulk_block(&self, _payload: &[u8]) -> Result<()> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      match self.behavior {
        Behavior::Accept => Ok(()),
        Behavior::AlreadyExists => Err(anyhow!(
          "insertBulkBlock failed (400): Block {} already exists",
          self.block_name
        )),
        Behavior::Proxy => Err(anyhow!("insertBulkBlock failed (502): Proxy Error")),
        Behavior::Reject => Err(anyhow!("insertBulkBlock failed (500): internal error")),
      }
    }

    async fn list_blocks(&self, _block_name: &str) -> Result<Vec<BlockListing>> {
      Ok(vec![])
    }
  }

  async fn run_one(behavior: Behavior) -> UploadResult {
    let name = "/prim/proc/tier#blk-1";
    let catalog = ScriptedCatalog::new(behavior, name);
    let pool = UploadPool::start(2, || catalog.clone() as Arc<dyn CatalogApi>);

    pool.submit(Submission { name: name.to_string(), payload: b"{}".to_vec() })
      .await
      .unwrap();
    let result = pool.recv_result(Duration::from_secs(5)).await.unwrap();
    pool.close().await;
    assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    result
  }

  #[tokio::test]
  async fn accepted_upload_is_uploaded() {
    let result = run_one(Behavior::Accept).await;
    assert_eq!(result.outcome, UploadOutcome::Uploaded);
    assert_eq!(result.name, "/prim/proc/tier#blk-1");
  }

  #[tokio::test]
  async fn duplicate_insert_is_promoted_to_uploaded() {
    let result = run_one(Behavior::AlreadyExists).await;
    assert_eq!(result.outcome, UploadOutcome::Uploaded);
  }

  #[tokio::test]
  async fn proxy_error_defers_to_check() {
    let result = run_one(Behavior::Proxy).await;
    assert_eq!(result.outcome, UploadOutcome::Check);
  }

  #[tokio::test]
  async fn other_errors_keep_their_message() {
    let result = run_one(Behavior::Reject).await;
    match result.outcome {
      UploadOutcome::Error(message) => assert!(message.contains("internal error")),
      other => panic!("expected an error outcome, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn close_joins_all_workers() {
    let catalog = ScriptedCatalog::new(Behavior::Accept, "unused");
    let pool = UploadPool::start(4, || catalog.clone() as Arc<dyn CatalogApi>);
    assert_eq!(pool.size(), 4);
    // no submissions; every worker should exit on its Stop
    pool.close().await;
  }

  #[tokio::test]
  async fn empty_queue_times_out() {
    let catalog = ScriptedCatalog::new(Behavior::Accept, "unused");
    let pool = UploadPool::start(1, || catalog.clone() as Arc<dyn CatalogApi>);
    assert!(pool.recv_result(Duration::from_millis(10)).await.is_none());
    pool.close().await;
  }
}
