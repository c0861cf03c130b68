use anyhow::Result;
use chrono::Utc;
use flexi_logger::{DeferredNow, Duplicate, LogSpecBuilder, Logger};
use log::{LevelFilter, Record};
use std::io::Write;

pub fn init_logger() -> Result<()> {
    // Configure log channels and their filtering rules
    let log_spec = LogSpecBuilder::new()
        .default(LevelFilter::Info) // Default log level
        .module("POLLER", LevelFilter::Info) // polling cycle
        .module("POOL", LevelFilter::Info) // upload workers
        .module("STORE", LevelFilter::Info) // staging database
        .module("CATALOG", LevelFilter::Info) // remote catalog client
        .build();

    Logger::with(log_spec)
        .format(custom_log_format)
        .log_to_file(flexi_logger::FileSpec::default().directory("logs"))
        .use_utc()
        .duplicate_to_stderr(Duplicate::All) // Also print logs to stderr
        .start()?;

    Ok(())
}

// Custom log format
pub fn custom_log_format(
    writer: &mut dyn Write, // A dynamic writer (stdout, file, etc.)
    _now: &mut DeferredNow, // DeferredNow to handle time formatting
    record: &Record,        // The actual log record
) -> std::io::Result<()> {
    // Format the time using chrono - UTC required
    let time = Utc::now().format("%Y-%m-%d %H:%M:%S:%3f").to_string();

    writeln!(
        writer,
        "{} [{}] {}", // E.g., 12:37:24:873 [POLLER] starting upload polling cycle
        time,
        record.target(), // Single channel, e.g., "POLLER"
        &record.args()   // The actual log message
    )
}
