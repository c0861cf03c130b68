use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

// Lifecycle of a block: Open -> Pending -> InDBS, never backwards
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlockStatus {
  Open,
  Pending,
  InDbs,
}

// map to database compatible strings
impl BlockStatus {
  pub fn from_db(s: &str) -> Result<BlockStatus> {
    match s {
      "Open" => Ok(BlockStatus::Open),
      "Pending" => Ok(BlockStatus::Pending),
      "InDBS" => Ok(BlockStatus::InDbs),
      _ => Err(anyhow!("Invalid block status: {}", s))
    }
  }
  pub fn to_db(&self) -> &str {
    match self {
      BlockStatus::Open => "Open",
      BlockStatus::Pending => "Pending",
      BlockStatus::InDbs => "InDBS",
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileStatus {
  NotUploaded,
  InDbs,
}

impl FileStatus {
  pub fn from_db(s: &str) -> Result<FileStatus> {
    match s {
      "NOTUPLOADED" => Ok(FileStatus::NotUploaded),
      "InDBS" => Ok(FileStatus::InDbs),
      _ => Err(anyhow!("Invalid file status: {}", s))
    }
  }
  pub fn to_db(&self) -> &str {
    match self {
      FileStatus::NotUploaded => "NOTUPLOADED",
      FileStatus::InDbs => "InDBS",
    }
  }
}

/// A produced file as recorded in the staging store.
/// `location` is already canonicalized to a single site tag by the adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagedFile {
  pub lfn: String,
  pub size: u64,
  pub events: u64,
  pub location: String,
  pub dataset_path: String,
  pub workflow: String,
  pub physics_group: Option<String>,
  pub prep_id: Option<String>,
  /// set when the file is already assigned to a block; such files are
  /// never packed again
  pub block: Option<String>,
}

/// One dataset+algorithm group with the stamps it puts on its blocks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DasGroup {
  pub das_id: i64,
  pub acquisition_era: String,
  pub processing_ver: String,
}

/// file -> block association, committed in its own transaction per cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileBlockBind {
  pub lfn: String,
  pub block_name: String,
}

/// Capacity limits of a block. A `None` on any axis disables closure on
/// every capacity axis (only status is consulted then).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BlockLimits {
  pub max_files: Option<u64>,
  pub max_events: Option<u64>,
  pub max_size: Option<u64>,
  /// seconds a block may stay open; only the explicit timeout sweep
  /// consults this, never the packing predicate
  pub max_age: Option<i64>,
}

/// A capacity-bounded batch of files, uploaded atomically to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
  pub name: String,
  pub location: String,
  pub das_id: i64,
  pub workflow: String,

  pub dataset_path: Option<String>,
  pub acquisition_era: Option<String>,
  pub processing_ver: Option<String>,
  pub physics_group: Option<String>,
  pub dataset_type: Option<String>,
  pub primary_dataset_type: Option<String>,
  pub prep_id: Option<String>,

  pub limits: BlockLimits,
  pub n_files: u64,
  pub n_events: u64,
  pub size: u64,
  /// epoch seconds when the block was opened
  pub create_time: i64,

  pub status: BlockStatus,
  /// true once a row for this block exists in the staging store
  pub in_buff: bool,
  pub files: Vec<StagedFile>,
}

impl Block {
  pub fn new(
    name: &str,
    location: &str,
    das_id: i64,
    workflow: &str,
    limits: BlockLimits,
    create_time: i64,
  ) -> Block {
    Block {
      name: name.to_string(),
      location: location.to_string(),
      das_id,
      workflow: workflow.to_string(),
      dataset_path: None,
      acquisition_era: None,
      processing_ver: None,
      physics_group: None,
      dataset_type: None,
      primary_dataset_type: None,
      prep_id: None,
      limits,
      n_files: 0,
      n_events: 0,
      size: 0,
      create_time,
      status: BlockStatus::Open,
      in_buff: false,
      files: vec![],
    }
  }

  /// Append a file and fold its size/events into the running totals.
  /// The first file stamps the dataset identity onto the block.
  /// Callers pack only into Open blocks (`can_accept`); hydration from the
  /// staging store also runs through here for blocks in any status.
  pub fn add_file(&mut self, file: StagedFile, dataset_type: &str, primary_dataset_type: &str) {
    if self.dataset_path.is_none() {
      self.dataset_path = Some(file.dataset_path.clone());
      self.physics_group = file.physics_group.clone();
      self.prep_id = file.prep_id.clone();
      self.dataset_type = Some(dataset_type.to_string());
      self.primary_dataset_type = Some(primary_dataset_type.to_string());
    }
    self.n_files += 1;
    self.n_events += file.events;
    self.size += file.size;
    self.files.push(file);
  }

  /// The packing predicate: can this file still go into this block?
  /// Age is deliberately not consulted here; the timeout sweep closes on
  /// age after packing, so a block about to time out may still absorb a
  /// file arriving this cycle.
  pub fn can_accept(&self, file: &StagedFile) -> bool {
    let BlockLimits { max_files, max_events, max_size, max_age } = self.limits;
    let (max_files, max_events, max_size, _max_age) =
      match (max_files, max_events, max_size, max_age) {
        (Some(f), Some(e), Some(s), Some(a)) => (f, e, s, a),
        // any unset limit leaves the block unbounded on all capacity axes
        _ => return self.status == BlockStatus::Open,
      };
    if self.status != BlockStatus::Open {
      return false;
    }
    if self.size + file.size > max_size {
      return false;
    }
    if self.n_events + file.events > max_events {
      return false;
    }
    if self.n_files >= max_files {
      return false;
    }
    true
  }

  /// Open -> Pending. Idempotent when already Pending.
  pub fn close_for_upload(&mut self) {
    if self.status == BlockStatus::Open {
      self.status = BlockStatus::Pending;
    }
  }

  /// Terminal transition once the catalog confirmed the block.
  pub fn mark_in_dbs(&mut self) {
    self.status = BlockStatus::InDbs;
  }

  pub fn age(&self, now: i64) -> i64 {
    now - self.create_time
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }
}

/// What a pool worker concluded about one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
  /// accepted by the catalog, or rejected as an already existing duplicate
  Uploaded,
  /// ambiguous proxy-level answer; probe the catalog next cycle
  Check,
  /// anything else; the block stays Pending and is retried
  Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
  pub name: String,
  pub outcome: UploadOutcome,
}
