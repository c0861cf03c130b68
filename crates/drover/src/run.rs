use std::time::Duration;

use anyhow::Result;
use log::{error, info};

use crate::config::Settings;
use crate::error::UploaderError;
use crate::poller::{open_staging_db, UploadPoller};

/// Run polling cycles until stopped. A retryable cycle error is logged and
/// the next tick tries again; the drain-exhaustion error is fatal once the
/// waiver has been spent. Ctrl-C runs one more pass, then tears the worker
/// pool down.
pub async fn run_daemon(settings: &Settings) -> Result<()> {
  let mut poller = UploadPoller::new(settings)?;
  let interval = Duration::from_secs(settings.upload.poll_interval);

  loop {
    if let Err(err) = poller.cycle().await {
      if is_fatal(&err) {
        error!(target: "POLLER", "fatal uploader error: {:#}", err);
        poller.shutdown().await;
        return Err(err);
      }
      error!(target: "POLLER", "upload cycle failed; retrying next tick: {:#}", err);
    }

    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!(target: "POLLER", "shutdown requested; doing one more pass");
        return poller.terminate().await;
      }
      _ = tokio::time::sleep(interval) => {}
    }
  }
}

/// Run a fixed number of cycles, then stop the pool and return.
pub async fn run_cycles(settings: &Settings, count: u32) -> Result<()> {
  let mut poller = UploadPoller::new(settings)?;
  for i in 0..count {
    info!(target: "POLLER", "running cycle {}/{}", i + 1, count);
    let result = poller.cycle().await;
    if result.is_err() {
      poller.shutdown().await;
      return result;
    }
  }
  poller.shutdown().await;
  Ok(())
}

/// Quick look at the staging store for the status subcommand.
pub fn print_status(settings: &Settings) -> Result<()> {
  let db = open_staging_db(&settings.store.path)?;

  println!("blocks:    {}", db.count_rows("blocks")?);
  println!("  open:    {}", db.count_rows_where("blocks", "status = 'Open'")?);
  println!("  pending: {}", db.count_rows_where("blocks", "status = 'Pending'")?);
  println!("  in dbs:  {}", db.count_rows_where("blocks", "status = 'InDBS'")?);
  println!("files:     {}", db.count_rows("files")?);
  println!("  waiting: {}", db.count_rows_where("files", "status = 'NOTUPLOADED'")?);
  println!();

  db.print_table_with_limit("blocks", 20)?;
  Ok(())
}

fn is_fatal(err: &anyhow::Error) -> bool {
  matches!(err.downcast_ref::<UploaderError>(), Some(UploaderError::DrainTimeout))
}
