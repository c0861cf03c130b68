use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use buffer_db::staging_db::StagingDb;
use catalog_lib::client::CatalogApi;
use catalog_lib::payload::serialize_block;
use catalog_lib::pool::{Submission, UploadPool};
use chrono::Utc;
use drover_types::{Block, BlockStatus, DasGroup, FileBlockBind, FileStatus, StagedFile, UploadOutcome, UploadResult};
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::BlockCache;
use crate::config::{Settings, UploadConfig};
use crate::error::UploaderError;

/// Builds one private catalog client per upload worker.
pub type CatalogFactory = Arc<dyn Fn() -> Arc<dyn CatalogApi> + Send + Sync>;

pub fn open_staging_db(path: &str) -> Result<StagingDb> {
  let db = if path == ":memory:" {
    StagingDb::new()?
  } else {
    StagingDb::new_from_file(path)?
  };
  Ok(db)
}

/// Poll-based block uploader. One cycle moves staged files into blocks,
/// writes the bookkeeping to the staging store and pushes closed blocks
/// through the worker pool into the remote catalog.
pub struct UploadPoller {
  cfg: UploadConfig,
  db: StagingDb,
  /// orchestrator-side client, used for the existence probes
  catalog: Arc<dyn CatalogApi>,
  factory: CatalogFactory,
  pool: Option<UploadPool>,
  cache: BlockCache,
  /// names submitted to the pool and not yet reconciled
  queued: HashSet<String>,
  /// file -> block binds accumulated while packing
  files_to_update: Vec<FileBlockBind>,
  /// ambiguous uploads to probe at the start of the next cycle
  blocks_to_check: Vec<String>,
  /// submissions still awaiting a worker result
  pending_results: usize,
  /// one-shot allowance: the first drain exhaustion yields the cycle
  /// instead of failing; only a process restart re-arms it
  timeout_waiver: bool,
}

impl UploadPoller {
  pub fn new(settings: &Settings) -> Result<UploadPoller> {
    let db = open_staging_db(&settings.store.path)?;
    let url = settings.catalog.url.clone();
    let factory: CatalogFactory =
      Arc::new(move || catalog_lib::client::get_client(&url) as Arc<dyn CatalogApi>);
    Ok(UploadPoller::with_parts(settings.upload.clone(), db, factory))
  }

  /// Wire the poller from parts; tests use this to swap in a scripted
  /// catalog and an in-memory store.
  pub fn with_parts(cfg: UploadConfig, db: StagingDb, factory: CatalogFactory) -> UploadPoller {
    let catalog = factory();
    UploadPoller {
      cfg,
      db,
      catalog,
      factory,
      pool: None,
      cache: BlockCache::new(),
      queued: HashSet::new(),
      files_to_update: vec![],
      blocks_to_check: vec![],
      pending_results: 0,
      timeout_waiver: true,
    }
  }

  /// One polling cycle:
  /// first check blocks whose earlier upload was ambiguous,
  /// then load open blocks, then pack new files into them,
  /// then write blocks to the staging store and hand them to the pool,
  /// then drain results and mark finished blocks as uploaded.
  pub async fn cycle(&mut self) -> Result<()> {
    match self.run_cycle().await {
      Ok(()) => Ok(()),
      Err(err) => match err.downcast::<UploaderError>() {
        Ok(uploader_err) => Err(uploader_err.into()),
        Err(other) => Err(UploaderError::Cycle(format!("{:#}", other)).into()),
      },
    }
  }

  async fn run_cycle(&mut self) -> Result<()> {
    info!(target: "POLLER", "starting upload polling cycle");
    self.check_blocks().await?;
    self.load_blocks()?;

    // In upload-only mode something else maps files into blocks and the
    // packing steps are skipped entirely.
    if !self.cfg.upload_only {
      self.load_files()?;
      self.check_timeout();
      self.check_completed()?;
    }

    self.input_blocks().await?;
    self.retrieve_blocks().await
  }

  /// One more pass, then tear the pool down.
  pub async fn terminate(&mut self) -> Result<()> {
    debug!(target: "POLLER", "terminating: doing one more pass before shutdown");
    let result = self.cycle().await;
    self.shutdown().await;
    result
  }

  /// Stop the workers without running another cycle.
  pub async fn shutdown(&mut self) {
    if let Some(pool) = self.pool.take() {
      pool.close().await;
    }
  }

  /// Probe the catalog for blocks whose upload outcome was ambiguous last
  /// cycle. A block the catalog already lists counts as uploaded; a failed
  /// probe keeps the name on the list.
  async fn check_blocks(&mut self) -> Result<()> {
    if self.blocks_to_check.is_empty() {
      return Ok(());
    }

    let names = std::mem::take(&mut self.blocks_to_check);
    let mut uploaded = vec![];
    for name in names {
      debug!(target: "POLLER", "checking block existence: {}", name);
      match self.catalog.list_blocks(&name).await {
        Ok(listings) => {
          if listings.iter().any(|listing| listing.block_name == name) {
            if let Some(block) = self.cache.get_mut(&name) {
              block.mark_in_dbs();
              uploaded.push(name);
            }
          }
          // not listed: the block is still pending and will be retried
        }
        Err(err) => {
          error!(target: "POLLER", "error checking block {} against the catalog: {:#}", name, err);
          self.blocks_to_check.push(name);
        }
      }
    }
    self.commit_terminal(&uploaded)
  }

  /// Find all open blocks in the staging store and make sure they are in
  /// the cache, files and all.
  fn load_blocks(&mut self) -> Result<()> {
    let open_blocks = self.db.find_open_blocks(self.cfg.upload_only)?;
    debug!(target: "POLLER", "open blocks in the staging store: {:?}", open_blocks);

    let to_load: Vec<String> = open_blocks
      .into_iter()
      .filter(|name| !self.cache.contains(name))
      .collect();
    if to_load.is_empty() {
      return Ok(());
    }

    let loaded = self
      .db
      .load_blocks(&to_load, self.cfg.upload_only)
      .context("loading blocks from the staging store")?;
    for mut block in loaded {
      let files = self
        .db
        .load_files_of_block(&block.name)
        .with_context(|| format!("loading files of block {}", block.name))?;
      info!(target: "POLLER", "have {} files for block {}", files.len(), block.name);
      for file in files {
        block.add_file(file, &self.cfg.dataset_type, &self.cfg.primary_dataset_type);
      }
      self.cache.insert(block);
    }
    Ok(())
  }

  /// Pack uploadable files into blocks, group by group. Files are
  /// partitioned by location; each partition extends the currently open
  /// block and rolls over to a fresh one when a file no longer fits.
  fn load_files(&mut self) -> Result<()> {
    let das_groups = self.db.find_uploadable_das_groups()?;
    for group in das_groups {
      let files = self
        .db
        .find_uploadable_files_by_das(group.das_id)
        .with_context(|| format!("loading uploadable files for das {}", group.das_id))?;

      // partition by location; BTreeMap keeps the order stable within
      // the cycle
      let mut by_location: BTreeMap<String, Vec<StagedFile>> = BTreeMap::new();
      for file in files {
        by_location.entry(file.location.clone()).or_default().push(file);
      }

      for (location, files) in by_location {
        if files.is_empty() {
          continue;
        }
        let mut current = self.get_or_open_block(&group, &location, &files[0]);

        for file in files {
          if file.block.is_some() {
            // already assigned to some block; it arrives with that block
            continue;
          }
          let accepts = self
            .cache
            .get(&current)
            .map(|block| block.can_accept(&file))
            .unwrap_or(false);
          if !accepts {
            // close the block and get a new one
            if let Some(block) = self.cache.get_mut(&current) {
              block.close_for_upload();
            }
            current = self.open_block(&group, &location, &file);
          }
          self.files_to_update.push(FileBlockBind {
            lfn: file.lfn.clone(),
            block_name: current.clone(),
          });
          if let Some(block) = self.cache.get_mut(&current) {
            block.add_file(file, &self.cfg.dataset_type, &self.cfg.primary_dataset_type);
          }
        }
      }
    }
    Ok(())
  }

  fn get_or_open_block(&mut self, group: &DasGroup, location: &str, file: &StagedFile) -> String {
    if let Some(name) = self.cache.find_open_for(group.das_id, location, file) {
      self.stamp_group(&name, group);
      return name;
    }
    self.open_block(group, location, file)
  }

  /// A suitable open block does not exist; create a fresh one.
  fn open_block(&mut self, group: &DasGroup, location: &str, file: &StagedFile) -> String {
    let name = format!("{}#{}", file.dataset_path, Uuid::new_v4());
    let block = Block::new(
      &name,
      location,
      group.das_id,
      &file.workflow,
      self.cfg.block_limits(),
      Utc::now().timestamp(),
    );
    self.cache.insert(block);
    self.stamp_group(&name, group);
    name
  }

  fn stamp_group(&mut self, name: &str, group: &DasGroup) {
    if let Some(block) = self.cache.get_mut(name) {
      block.acquisition_era = Some(group.acquisition_era.clone());
      block.processing_ver = Some(group.processing_ver.clone());
    }
  }

  /// Age sweep: mark Open blocks past their age limit as Pending.
  fn check_timeout(&mut self) {
    let now = Utc::now().timestamp();
    for name in self.cache.names() {
      if let Some(block) = self.cache.get_mut(&name) {
        let timed_out = block.status == BlockStatus::Open
          && block.limits.max_age.map(|max| block.age(now) > max).unwrap_or(false);
        if timed_out {
          info!(target: "POLLER", "closing block {} for age", name);
          block.close_for_upload();
        }
      }
    }
  }

  /// Once upstream finished a workflow no further file will ever join its
  /// blocks, so holding them open yields nothing.
  fn check_completed(&mut self) -> Result<()> {
    let completed: HashSet<String> = self.db.get_completed_workflows()?.into_iter().collect();
    if completed.is_empty() {
      return Ok(());
    }
    for name in self.cache.names() {
      if let Some(block) = self.cache.get_mut(&name) {
        if block.status == BlockStatus::Open && completed.contains(&block.workflow) {
          info!(target: "POLLER", "closing block {} of completed workflow {}", name, block.workflow);
          block.close_for_upload();
        }
      }
    }
    Ok(())
  }

  /// Sort the cached blocks, write new and updated rows to the staging
  /// store, commit the file binds and hand every dispatchable Pending
  /// block to the worker pool.
  ///
  /// Ordering matters: block rows commit before the binds commit, and both
  /// commit before any payload reaches the pool, so a bind never
  /// references a block row that does not exist yet.
  async fn input_blocks(&mut self) -> Result<()> {
    let mut create_in_dbs = vec![];
    let mut create_in_buffer = vec![];
    let mut update_in_buffer = vec![];
    for (name, block) in self.cache.iter() {
      if self.queued.contains(name) {
        // already being handled by a worker
        continue;
      }
      match block.status {
        BlockStatus::Pending => {
          create_in_dbs.push(name.clone());
          if block.in_buff {
            update_in_buffer.push(name.clone());
          } else {
            create_in_buffer.push(name.clone());
          }
        }
        BlockStatus::Open if !block.in_buff => create_in_buffer.push(name.clone()),
        _ => {}
      }
    }
    create_in_dbs.sort();
    create_in_buffer.sort();
    update_in_buffer.sort();

    // build the pool if it was closed
    if self.pool.is_none() {
      let factory = self.factory.clone();
      self.pool = Some(UploadPool::start(self.cfg.n_workers, move || factory()));
    }

    // first the new and updated block rows, in one session
    if !create_in_buffer.is_empty() || !update_in_buffer.is_empty() {
      let creates: Vec<&Block> = create_in_buffer.iter().filter_map(|n| self.cache.get(n)).collect();
      let updates: Vec<&Block> = update_in_buffer.iter().filter_map(|n| self.cache.get(n)).collect();
      let tx = self.db.transaction()?;
      StagingDb::create_blocks(&tx, &creates)?;
      StagingDb::update_blocks(&tx, &updates, self.cfg.upload_only)?;
      tx.commit().context("writing new blocks into the staging store")?;
    }
    // mark what now has a row in the staging store
    for name in &create_in_buffer {
      if let Some(block) = self.cache.get_mut(name) {
        block.in_buff = true;
      }
    }

    // then the new file/block associations, in their own session; the
    // buffer resets only once the commit went through
    if !self.files_to_update.is_empty() {
      let tx = self.db.transaction()?;
      StagingDb::set_block_files(&tx, &self.files_to_update)?;
      tx.commit().context("writing file-block binds")?;
      self.files_to_update.clear();
    }

    // finally hand the pending blocks to the pool
    for name in create_in_dbs {
      let Some(block) = self.cache.get_mut(&name) else { continue };
      if block.is_empty() {
        debug!(target: "POLLER", "skipping empty block {}", name);
        continue;
      }
      block.physics_group = Some(self.cfg.physics_group.clone());
      let payload = serialize_block(block)?;
      if self.cfg.copy_block {
        std::fs::write(&self.cfg.copy_block_path, &payload)
          .with_context(|| format!("writing block copy to {}", self.cfg.copy_block_path))?;
      }
      info!(target: "POLLER", "about to insert block {}", name);
      if let Some(pool) = &self.pool {
        pool.submit(Submission { name: name.clone(), payload }).await?;
      }
      self.queued.insert(name);
      self.pending_results += 1;
    }
    Ok(())
  }

  /// Drain the completion queue and reconcile the outcomes with the
  /// staging store.
  async fn retrieve_blocks(&mut self) -> Result<()> {
    let mut to_close: Vec<UploadResult> = vec![];
    let mut empty_count: usize = 0;
    let mut drained = true;
    while self.pending_results > 0 {
      if empty_count > self.cfg.n_tries {
        // A large backlog after downtime can legitimately outlast the
        // drain budget once; spend the waiver and pick the rest up next
        // cycle. The waiver only re-arms on process restart.
        if !self.timeout_waiver {
          return Err(UploaderError::DrainTimeout.into());
        }
        self.timeout_waiver = false;
        warn!(target: "POLLER", "upload results not drained in time; yielding the rest of this cycle");
        drained = false;
        break;
      }
      let wait = Duration::from_secs(self.cfg.wait_time);
      let result = match &self.pool {
        Some(pool) => pool.recv_result(wait).await,
        None => None,
      };
      match result {
        Some(result) => {
          debug!(target: "POLLER", "got a result for block {}", result.name);
          to_close.push(result);
          self.pending_results -= 1;
        }
        None => {
          tokio::time::sleep(wait).await;
          empty_count += 1;
        }
      }
    }

    let mut loaded = vec![];
    for result in to_close {
      // exactly one result per in-flight block
      self.queued.remove(&result.name);
      match result.outcome {
        UploadOutcome::Uploaded => {
          if let Some(block) = self.cache.get_mut(&result.name) {
            block.mark_in_dbs();
            loaded.push(result.name);
          }
        }
        UploadOutcome::Check => {
          self.blocks_to_check.push(result.name);
        }
        UploadOutcome::Error(message) => {
          // block remains Pending and is re-attempted next cycle
          error!(target: "POLLER", "error uploading block {}: {}", result.name, message);
        }
      }
    }

    self.commit_terminal(&loaded)?;

    // clean up the pool so nothing waits around between cycles; after a
    // waived drain it stays alive for the missing results
    if drained {
      self.shutdown().await;
    }
    Ok(())
  }

  /// Commit terminal status for the named blocks, then evict them from
  /// the cache. The commit happens first so a failure leaves the blocks
  /// cached and retried next cycle.
  fn commit_terminal(&mut self, names: &[String]) -> Result<()> {
    if names.is_empty() {
      return Ok(());
    }
    {
      let blocks: Vec<&Block> = names.iter().filter_map(|name| self.cache.get(name)).collect();
      let tx = self.db.transaction()?;
      StagingDb::update_blocks(&tx, &blocks, self.cfg.upload_only)?;
      if !self.cfg.upload_only {
        StagingDb::update_file_status(&tx, &blocks, FileStatus::InDbs)?;
      }
      tx.commit().context("writing uploaded block status")?;
    }
    for name in names {
      self.cache.remove(name);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use anyhow::anyhow;
  use async_trait::async_trait;
  use catalog_lib::client::BlockListing;
  use drover_types::BlockLimits;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  #[derive(Debug, Clone, Copy, PartialEq)]
  enum InsertMode {
    Accept,
    AlreadyExists,
    Proxy,
    Hang,
  }

  struct MockCatalog {
    mode: Mutex<InsertMode>,
    inserts: AtomicUsize,
    known: Mutex<HashSet<String>>,
  }

  impl MockCatalog {
    fn new(mode: InsertMode) -> Arc<MockCatalog> {
      Arc::new(MockCatalog {
        mode: Mutex::new(mode),
        inserts: AtomicUsize::new(0),
        known: Mutex::new(HashSet::new()),
      })
    }

    fn insert_count(&self) -> usize {
      self.inserts.load(Ordering::SeqCst)
    }

    fn add_known(&self, name: &str) {
      self.known.lock().unwrap().insert(name.to_string());
    }

    fn name_from_payload(payload: &[u8]) -> String {
      let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
      value["block"]["block_name"].as_str().unwrap().to_string()
    }
  }

  #[async_trait]
  impl CatalogApi for MockCatalog {
    async fn insert_bulk_block(&self, payload: &[u8]) -> Result<()> {
      let mode = *self.mode.lock().unwrap();
      if mode == InsertMode::Hang {
        std::future::pending::<()>().await;
      }
      self.inserts.fetch_add(1, Ordering::SeqCst);
      let name = Self::name_from_payload(payload);
      match mode {
        InsertMode::Accept => {
          self.known.lock().unwrap().insert(name);
          Ok(())
        }
        InsertMode::AlreadyExists => {
          Err(anyhow!("insertBulkBlock failed (400): Block {} already exists", name))
        }
        InsertMode::Proxy => Err(anyhow!("insertBulkBlock failed (502): Proxy Error")),
        InsertMode::Hang => unreachable!(),
      }
    }

    async fn list_blocks(&self, block_name: &str) -> Result<Vec<BlockListing>> {
      if self.known.lock().unwrap().contains(block_name) {
        Ok(vec![BlockListing { block_name: block_name.to_string() }])
      } else {
        Ok(vec![])
      }
    }
  }

  fn test_config() -> UploadConfig {
    UploadConfig {
      n_workers: 2,
      wait_time: 1,
      max_block_files: Some(5),
      max_block_events: Some(1000),
      max_block_size: Some(100),
      max_block_time: Some(3600),
      ..UploadConfig::default()
    }
  }

  fn test_poller(cfg: UploadConfig, catalog: Arc<MockCatalog>) -> UploadPoller {
    let db = StagingDb::new().unwrap();
    db.insert_dataset_algo(1, "/prim/proc/tier", "Era2024", "v1").unwrap();
    db.add_workflow("wf-1", false).unwrap();
    let factory: CatalogFactory = Arc::new(move || catalog.clone() as Arc<dyn CatalogApi>);
    UploadPoller::with_parts(cfg, db, factory)
  }

  fn staged_file(lfn: &str, size: u64, events: u64) -> StagedFile {
    StagedFile {
      lfn: lfn.to_string(),
      size,
      events,
      location: "site-a".to_string(),
      dataset_path: "/prim/proc/tier".to_string(),
      workflow: "wf-1".to_string(),
      physics_group: None,
      prep_id: None,
      block: None,
    }
  }

  fn seed_files(poller: &mut UploadPoller, specs: &[(&str, u64, u64)]) {
    let files: Vec<StagedFile> = specs.iter().map(|(lfn, size, events)| staged_file(lfn, *size, *events)).collect();
    poller.db.insert_files_bulk(1, &files).unwrap();
  }

  #[tokio::test]
  async fn cold_start_packs_three_files_into_one_open_block() {
    let catalog = MockCatalog::new(InsertMode::Accept);
    let mut poller = test_poller(test_config(), catalog.clone());
    seed_files(&mut poller, &[("lfn-a", 10, 100), ("lfn-b", 10, 100), ("lfn-c", 10, 100)]);

    poller.cycle().await.unwrap();

    // one open block holding all three files, nothing submitted
    assert_eq!(catalog.insert_count(), 0);
    assert_eq!(poller.cache.len(), 1);
    let name = poller.cache.names().remove(0);
    let block = poller.cache.get(&name).unwrap();
    assert_eq!(block.status, BlockStatus::Open);
    assert_eq!(block.n_files, 3);
    assert!(block.in_buff);
    assert_eq!(block.acquisition_era.as_deref(), Some("Era2024"));

    // block row and all three binds committed
    assert_eq!(poller.db.get_block_status(&name).unwrap().as_deref(), Some("Open"));
    for lfn in ["lfn-a", "lfn-b", "lfn-c"] {
      let (assignment, _) = poller.db.get_file_assignment(lfn).unwrap().unwrap();
      assert_eq!(assignment.as_deref(), Some(name.as_str()));
    }
    assert!(poller.files_to_update.is_empty());
    assert!(poller.queued.is_empty());
    assert_eq!(poller.pending_results, 0);
  }

  #[tokio::test]
  async fn second_cycle_without_new_files_is_a_no_op() {
    let catalog = MockCatalog::new(InsertMode::Accept);
    let mut poller = test_poller(test_config(), catalog.clone());
    seed_files(&mut poller, &[("lfn-a", 10, 100), ("lfn-b", 10, 100)]);

    poller.cycle().await.unwrap();
    let names_before = poller.cache.names();

    poller.cycle().await.unwrap();

    assert_eq!(catalog.insert_count(), 0);
    assert_eq!(poller.cache.names(), names_before);
    assert_eq!(poller.db.count_rows("blocks").unwrap(), 1);
    assert!(poller.files_to_update.is_empty());
  }

  #[tokio::test]
  async fn oversized_file_rolls_over_into_a_fresh_block() {
    let catalog = MockCatalog::new(InsertMode::Accept);
    let mut poller = test_poller(test_config(), catalog.clone());
    seed_files(&mut poller, &[("lfn-a", 10, 100), ("lfn-b", 10, 100), ("lfn-c", 10, 100)]);
    poller.cycle().await.unwrap();
    let first = poller.cache.names().remove(0);

    // 30 + 95 > 100: the fourth file closes the first block
    seed_files(&mut poller, &[("lfn-d", 95, 100)]);
    poller.cycle().await.unwrap();

    // first block was closed, uploaded and evicted
    assert_eq!(catalog.insert_count(), 1);
    assert_eq!(poller.db.get_block_status(&first).unwrap().as_deref(), Some("InDBS"));
    assert!(poller.cache.get(&first).is_none());
    for lfn in ["lfn-a", "lfn-b", "lfn-c"] {
      let (_, status) = poller.db.get_file_assignment(lfn).unwrap().unwrap();
      assert_eq!(status, "InDBS");
    }

    // the fresh block holds only the fourth file and is still open
    assert_eq!(poller.cache.len(), 1);
    let second = poller.cache.names().remove(0);
    assert_ne!(second, first);
    let block = poller.cache.get(&second).unwrap();
    assert_eq!(block.status, BlockStatus::Open);
    assert_eq!(block.n_files, 1);

    // completing the workflow flushes the second block too
    poller.db.mark_workflow_completed("wf-1").unwrap();
    poller.cycle().await.unwrap();
    assert_eq!(catalog.insert_count(), 2);
    assert_eq!(poller.db.get_block_status(&second).unwrap().as_deref(), Some("InDBS"));
    assert!(poller.cache.is_empty());
  }

  #[tokio::test]
  async fn duplicate_remote_response_counts_as_uploaded() {
    let catalog = MockCatalog::new(InsertMode::AlreadyExists);
    let mut poller = test_poller(test_config(), catalog.clone());
    seed_files(&mut poller, &[("lfn-a", 10, 100)]);
    poller.db.mark_workflow_completed("wf-1").unwrap();

    poller.cycle().await.unwrap();

    assert_eq!(catalog.insert_count(), 1);
    assert!(poller.cache.is_empty());
    assert!(poller.queued.is_empty());
    let blocks = poller.db.query_to_json("SELECT name, status FROM blocks").unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0]["status"], "InDBS");
  }

  #[tokio::test]
  async fn proxy_error_defers_to_the_next_cycle_probe() {
    let catalog = MockCatalog::new(InsertMode::Proxy);
    let mut poller = test_poller(test_config(), catalog.clone());
    seed_files(&mut poller, &[("lfn-a", 10, 100)]);
    poller.db.mark_workflow_completed("wf-1").unwrap();

    poller.cycle().await.unwrap();

    // ambiguous outcome: block stays pending, name goes on the check list
    assert_eq!(poller.blocks_to_check.len(), 1);
    let name = poller.blocks_to_check[0].clone();
    assert_eq!(poller.db.get_block_status(&name).unwrap().as_deref(), Some("Pending"));
    assert_eq!(poller.cache.get(&name).unwrap().status, BlockStatus::Pending);
    assert!(poller.queued.is_empty());

    // next cycle the probe finds the block in the catalog
    catalog.add_known(&name);
    poller.cycle().await.unwrap();

    assert!(poller.blocks_to_check.is_empty());
    assert!(poller.cache.is_empty());
    assert_eq!(poller.db.get_block_status(&name).unwrap().as_deref(), Some("InDBS"));
    // the probe resolved it; no second insert went out
    assert_eq!(catalog.insert_count(), 1);
  }

  #[tokio::test]
  async fn completed_workflow_closes_and_uploads_its_block() {
    let catalog = MockCatalog::new(InsertMode::Accept);
    let mut poller = test_poller(test_config(), catalog.clone());
    seed_files(&mut poller, &[("lfn-a", 10, 100)]);
    poller.db.mark_workflow_completed("wf-1").unwrap();

    poller.cycle().await.unwrap();

    assert_eq!(catalog.insert_count(), 1);
    assert!(poller.cache.is_empty());
    let (assignment, status) = poller.db.get_file_assignment("lfn-a").unwrap().unwrap();
    assert!(assignment.is_some());
    assert_eq!(status, "InDBS");
  }

  #[tokio::test]
  async fn drain_timeout_is_waived_once_then_fatal() {
    let catalog = MockCatalog::new(InsertMode::Hang);
    let mut cfg = test_config();
    cfg.wait_time = 0;
    cfg.n_tries = 2;
    let mut poller = test_poller(cfg, catalog.clone());
    seed_files(&mut poller, &[("lfn-a", 10, 100)]);
    poller.db.mark_workflow_completed("wf-1").unwrap();

    // first exhaustion spends the waiver and yields the cycle
    poller.cycle().await.unwrap();
    assert!(!poller.timeout_waiver);
    assert_eq!(poller.pending_results, 1);
    assert_eq!(poller.queued.len(), 1);

    // second exhaustion is fatal
    let err = poller.cycle().await.unwrap_err();
    assert!(matches!(
      err.downcast_ref::<UploaderError>(),
      Some(UploaderError::DrainTimeout)
    ));
  }

  #[tokio::test]
  async fn empty_pending_blocks_are_never_submitted() {
    let catalog = MockCatalog::new(InsertMode::Accept);
    let mut poller = test_poller(test_config(), catalog.clone());

    let mut block = Block::new(
      "/prim/proc/tier#empty",
      "site-a",
      1,
      "wf-1",
      BlockLimits::default(),
      Utc::now().timestamp(),
    );
    block.close_for_upload();
    poller.cache.insert(block);

    poller.input_blocks().await.unwrap();

    assert_eq!(catalog.insert_count(), 0);
    assert_eq!(poller.pending_results, 0);
    assert!(poller.queued.is_empty());
    // the row was still written to the staging store
    assert_eq!(
      poller.db.get_block_status("/prim/proc/tier#empty").unwrap().as_deref(),
      Some("Pending")
    );
    poller.shutdown().await;
  }

  #[tokio::test]
  async fn upload_only_mode_ships_prepacked_blocks_without_file_updates() {
    let catalog = MockCatalog::new(InsertMode::Accept);
    let mut cfg = test_config();
    cfg.upload_only = true;
    let mut poller = test_poller(cfg, catalog.clone());

    // an external producer already packed the block and bound its file
    let mut block = Block::new(
      "/prim/proc/tier#prepacked",
      "site-a",
      1,
      "wf-1",
      BlockLimits::default(),
      Utc::now().timestamp(),
    );
    block.close_for_upload();
    let tx = poller.db.transaction().unwrap();
    StagingDb::create_blocks(&tx, &[&block]).unwrap();
    tx.commit().unwrap();
    poller.db.insert_files_bulk(1, &[staged_file("lfn-a", 10, 100)]).unwrap();
    let binds = vec![FileBlockBind {
      lfn: "lfn-a".to_string(),
      block_name: block.name.clone(),
    }];
    let tx = poller.db.transaction().unwrap();
    StagingDb::set_block_files(&tx, &binds).unwrap();
    tx.commit().unwrap();

    poller.cycle().await.unwrap();

    assert_eq!(catalog.insert_count(), 1);
    assert_eq!(
      poller.db.get_block_status(&block.name).unwrap().as_deref(),
      Some("InDBS")
    );
    // per-file status updates are skipped in upload-only mode
    let (_, status) = poller.db.get_file_assignment("lfn-a").unwrap().unwrap();
    assert_eq!(status, "NOTUPLOADED");
  }
}
