use std::collections::HashMap;

use drover_types::{Block, StagedFile};

/// Primary block cache plus the das -> location -> [name] index used to
/// locate the open block for an incoming file. Every name in the index
/// resolves in the primary map; both are maintained together on insert
/// and remove.
#[derive(Default)]
pub struct BlockCache {
  blocks: HashMap<String, Block>,
  das_index: HashMap<i64, HashMap<String, Vec<String>>>,
}

impl BlockCache {
  pub fn new() -> BlockCache {
    BlockCache {
      blocks: HashMap::new(),
      das_index: HashMap::new(),
    }
  }

  /// add a block everywhere it has to go
  pub fn insert(&mut self, block: Block) {
    let bucket = self
      .das_index
      .entry(block.das_id)
      .or_default()
      .entry(block.location.clone())
      .or_default();
    if !bucket.contains(&block.name) {
      bucket.push(block.name.clone());
    }
    self.blocks.insert(block.name.clone(), block);
  }

  pub fn get(&self, name: &str) -> Option<&Block> {
    self.blocks.get(name)
  }

  pub fn get_mut(&mut self, name: &str) -> Option<&mut Block> {
    self.blocks.get_mut(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.blocks.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.blocks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.blocks.is_empty()
  }

  pub fn names(&self) -> Vec<String> {
    self.blocks.keys().cloned().collect()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Block)> {
    self.blocks.iter()
  }

  pub fn remove(&mut self, name: &str) -> Option<Block> {
    let block = self.blocks.remove(name)?;
    if let Some(locations) = self.das_index.get_mut(&block.das_id) {
      if let Some(bucket) = locations.get_mut(&block.location) {
        bucket.retain(|n| n != name);
      }
    }
    Some(block)
  }

  /// Find an open block in this (das, location) bucket that still accepts
  /// the file. Bucket entries that are closed or full are lazily marked
  /// Pending in place so the dispatch step picks them up, and the scan
  /// continues.
  pub fn find_open_for(&mut self, das_id: i64, location: &str, file: &StagedFile) -> Option<String> {
    let bucket = self.das_index.get(&das_id)?.get(location)?.clone();
    for name in bucket {
      let Some(block) = self.blocks.get_mut(&name) else { continue };
      if block.can_accept(file) {
        return Some(name);
      }
      // block isn't open anymore; mark it pending so it gets uploaded
      block.close_for_upload();
    }
    None
  }

  /// index names must resolve in the primary cache
  #[cfg(test)]
  fn is_consistent(&self) -> bool {
    self
      .das_index
      .values()
      .flat_map(|locations| locations.values())
      .flatten()
      .all(|name| self.blocks.contains_key(name))
  }
}
