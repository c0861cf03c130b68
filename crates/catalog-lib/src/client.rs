use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One entry of the catalog's block listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockListing {
  pub block_name: String,
}

/// The two catalog operations the uploader needs: the bulk insert and the
/// existence probe used for straggler reconciliation.
#[async_trait]
pub trait CatalogApi: Send + Sync {
  async fn insert_bulk_block(&self, payload: &[u8]) -> Result<()>;
  async fn list_blocks(&self, block_name: &str) -> Result<Vec<BlockListing>>;
}

pub struct CatalogClient {
  base_url: String,
  http: reqwest::Client,
}

pub fn get_client(url: &str) -> Arc<CatalogClient> {
  Arc::new(CatalogClient::new(url))
}

impl CatalogClient {
  pub fn new(url: &str) -> CatalogClient {
    CatalogClient {
      base_url: url.trim_end_matches('/').to_string(),
      http: reqwest::Client::new(),
    }
  }
}

#[async_trait]
impl CatalogApi for CatalogClient {
  async fn insert_bulk_block(&self, payload: &[u8]) -> Result<()> {
    let url = format!("{}/bulkblocks", self.base_url);
    let res = self.http
      .post(&url)
      .header("Content-Type", "application/json")
      .body(payload.to_vec())
      .send()
      .await?;

    let status = res.status();
    if status.is_success() {
      return Ok(());
    }
    // error bodies carry the catalog's reason, e.g. a duplicate-block
    // message; callers classify on the text
    let body = res.text().await.unwrap_or_default();
    Err(anyhow!("insertBulkBlock failed ({}): {}", status, body))
  }

  async fn list_blocks(&self, block_name: &str) -> Result<Vec<BlockListing>> {
    let url = format!("{}/blocks", self.base_url);
    let res = self.http
      .get(&url)
      .query(&[("block_name", block_name)])
      .send()
      .await?;

    let status = res.status();
    if !status.is_success() {
      let body = res.text().await.unwrap_or_default();
      return Err(anyhow!("listBlocks failed ({}): {}", status, body));
    }
    let listings = res.json::<Vec<BlockListing>>().await?;
    Ok(listings)
  }
}
