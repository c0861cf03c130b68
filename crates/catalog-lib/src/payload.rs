use anyhow::Result;
use drover_types::Block;
use serde::{Deserialize, Serialize};

// Wire-facing snapshot of a block. The catalog owns this schema; the
// uploader only needs it to round-trip through the worker boundary and to
// identify the block by name.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockHeader {
  pub block_name: String,
  pub origin_site_name: String,
  pub file_count: u64,
  pub block_size: u64,
  pub open_for_writing: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetInfo {
  pub dataset: String,
  pub primary_ds_name: String,
  pub primary_ds_type: String,
  pub processed_ds_name: String,
  pub dataset_access_type: String,
  pub physics_group_name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub prep_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionEra {
  pub acquisition_era_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingEra {
  pub processing_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
  pub logical_file_name: String,
  pub file_size: u64,
  pub event_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockPayload {
  pub block: BlockHeader,
  pub dataset: DatasetInfo,
  pub acquisition_era: AcquisitionEra,
  pub processing_era: ProcessingEra,
  pub files: Vec<FileRecord>,
  pub file_count: u64,
}

impl BlockPayload {
  pub fn from_block(block: &Block) -> BlockPayload {
    let dataset_path = block.dataset_path.clone().unwrap_or_default();
    // dataset paths look like /<primary>/<processed>/<tier>
    let mut parts = dataset_path.split('/').filter(|p| !p.is_empty());
    let primary_ds_name = parts.next().unwrap_or("").to_string();
    let processed_ds_name = parts.next().unwrap_or("").to_string();

    BlockPayload {
      block: BlockHeader {
        block_name: block.name.clone(),
        origin_site_name: block.location.clone(),
        file_count: block.n_files,
        block_size: block.size,
        open_for_writing: 0,
      },
      dataset: DatasetInfo {
        dataset: dataset_path,
        primary_ds_name,
        primary_ds_type: block.primary_dataset_type.clone().unwrap_or_else(|| "mc".to_string()),
        processed_ds_name,
        dataset_access_type: block.dataset_type.clone().unwrap_or_else(|| "PRODUCTION".to_string()),
        physics_group_name: block.physics_group.clone().unwrap_or_else(|| "NoGroup".to_string()),
        prep_id: block.prep_id.clone(),
      },
      acquisition_era: AcquisitionEra {
        acquisition_era_name: block.acquisition_era.clone().unwrap_or_default(),
      },
      processing_era: ProcessingEra {
        processing_version: block.processing_ver.clone().unwrap_or_default(),
      },
      files: block.files.iter().map(|f| FileRecord {
        logical_file_name: f.lfn.clone(),
        file_size: f.size,
        event_count: f.events,
      }).collect(),
      file_count: block.n_files,
    }
  }
}

/// Serialize once at the submission boundary; workers never reach back
/// into shared state.
pub fn serialize_block(block: &Block) -> Result<Vec<u8>> {
  let payload = BlockPayload::from_block(block);
  Ok(serde_json::to_vec(&payload)?)
}
