use drover_types::{
    Block, BlockLimits, BlockStatus, DasGroup, FileBlockBind, FileStatus, StagedFile,
};
use duckdb::{params, Connection, Result, Transaction};
use serde_json::{json, Value};

use crate::utils::print_json_objects_as_table;

fn create_connection(file_path: Option<&str>) -> Result<Connection> {
    let conn = match file_path {
        Some(path) => {
            // make sure the dir path exists; opening reports any failure
            if let Some(dir_path) = std::path::Path::new(path).parent() {
                if !dir_path.as_os_str().is_empty() && !dir_path.exists() {
                    let _ = std::fs::create_dir_all(dir_path);
                }
            }

            Connection::open(path)?
        }
        None => Connection::open_in_memory()?,
    };

    conn.execute_batch(
        "
      BEGIN;

      CREATE TABLE IF NOT EXISTS dataset_algo (
        id BIGINT PRIMARY KEY,
        dataset_path TEXT,
        acquisition_era TEXT,
        processing_ver TEXT
      );
      CREATE TABLE IF NOT EXISTS blocks (
        name TEXT PRIMARY KEY,
        das_id BIGINT,
        location TEXT,
        workflow TEXT,
        status TEXT,
        create_time BIGINT,
        max_files BIGINT DEFAULT NULL,
        max_events BIGINT DEFAULT NULL,
        max_size BIGINT DEFAULT NULL,
        max_age BIGINT DEFAULT NULL
      );
      CREATE TABLE IF NOT EXISTS files (
        lfn TEXT PRIMARY KEY,
        das_id BIGINT,
        size BIGINT,
        events BIGINT,
        locations TEXT, -- comma joined site tags
        dataset_path TEXT,
        workflow TEXT,
        physics_group TEXT DEFAULT NULL,
        prep_id TEXT DEFAULT NULL,
        block_name TEXT DEFAULT NULL,
        status TEXT DEFAULT 'NOTUPLOADED'
      );
      CREATE TABLE IF NOT EXISTS workflows (
        name TEXT PRIMARY KEY,
        completed BOOLEAN DEFAULT FALSE
      );
      COMMIT;
      ",
    )?;

    Ok(conn)
}

/// the set of site tags is canonicalized to one tag at the adapter
/// boundary; lexicographic min keeps the choice stable within a cycle
fn first_location(locations: &str) -> String {
    locations
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .min()
        .unwrap_or("")
        .to_string()
}

pub struct StagingDb {
    pub conn: Connection,
    path: Option<String>,
}

impl StagingDb {
    pub fn new() -> Result<StagingDb> {
        // default create in-memory db
        let conn = create_connection(None)?;
        Ok(StagingDb { conn, path: None })
    }

    pub fn new_from_file(file_path: &str) -> Result<StagingDb> {
        let conn = create_connection(Some(file_path))?;
        Ok(StagingDb {
            conn,
            path: Some(file_path.to_string()),
        })
    }

    pub fn get_path(&self) -> Option<String> {
        self.path.clone()
    }

    /// One explicit session for the caller to bracket its writes in.
    /// Dropping the transaction without commit rolls it back.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    // ---- reads -----------------------------------------------------------

    /// Names of blocks still open in the staging store. In upload-only mode
    /// an external producer closes blocks itself, so Pending rows count too.
    pub fn find_open_blocks(&self, upload_only: bool) -> Result<Vec<String>> {
        let query = if upload_only {
            "SELECT name FROM blocks WHERE status IN ('Open', 'Pending') ORDER BY name"
        } else {
            "SELECT name FROM blocks WHERE status = 'Open' ORDER BY name"
        };
        let mut stmt = self.conn.prepare(query)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Full metadata for the named blocks. Files are loaded separately
    /// through `load_files_of_block`.
    pub fn load_blocks(&self, names: &[String], upload_only: bool) -> Result<Vec<Block>> {
        let status_filter = if upload_only {
            "b.status IN ('Open', 'Pending')"
        } else {
            "b.status = 'Open'"
        };
        let query = format!(
            "SELECT b.name, b.das_id, b.location, b.workflow, b.status, b.create_time,
                    b.max_files, b.max_events, b.max_size, b.max_age,
                    da.acquisition_era, da.processing_ver
             FROM blocks b
             JOIN dataset_algo da ON da.id = b.das_id
             WHERE b.name = ? AND {}",
            status_filter
        );
        let mut stmt = self.conn.prepare(&query)?;

        let mut blocks = Vec::new();
        for name in names {
            let mut rows = stmt.query_map(params![name], |row| {
                let limits = BlockLimits {
                    max_files: row.get(6)?,
                    max_events: row.get(7)?,
                    max_size: row.get(8)?,
                    max_age: row.get(9)?,
                };
                let mut block = Block::new(
                    &row.get::<_, String>(0)?,
                    &row.get::<_, String>(2)?,
                    row.get(1)?,
                    &row.get::<_, String>(3)?,
                    limits,
                    row.get(5)?,
                );
                block.acquisition_era = Some(row.get(10)?);
                block.processing_ver = Some(row.get(11)?);
                Ok((block, row.get::<_, String>(4)?))
            })?;
            if let Some(row) = rows.next() {
                let (mut block, status) = row?;
                block.status = BlockStatus::from_db(&status).map_err(|err| {
                    duckdb::Error::FromSqlConversionFailure(
                        4,
                        duckdb::types::Type::Text,
                        err.into(),
                    )
                })?;
                // the row itself is the in-buffer flag
                block.in_buff = true;
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    /// Files already assigned to the given block.
    pub fn load_files_of_block(&self, block_name: &str) -> Result<Vec<StagedFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT lfn, size, events, locations, dataset_path, workflow,
                    physics_group, prep_id, block_name
             FROM files WHERE block_name = ? ORDER BY lfn",
        )?;
        let rows = stmt.query_map(params![block_name], Self::file_from_row)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Dataset-algo groups that still have files waiting for a block.
    pub fn find_uploadable_das_groups(&self) -> Result<Vec<DasGroup>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT da.id, da.acquisition_era, da.processing_ver
             FROM dataset_algo da
             JOIN files f ON f.das_id = da.id
             WHERE f.status = 'NOTUPLOADED' AND f.block_name IS NULL
             ORDER BY da.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DasGroup {
                das_id: row.get(0)?,
                acquisition_era: row.get(1)?,
                processing_ver: row.get(2)?,
            })
        })?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// Unassigned uploadable files of one group, in stable lfn order.
    pub fn find_uploadable_files_by_das(&self, das_id: i64) -> Result<Vec<StagedFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT lfn, size, events, locations, dataset_path, workflow,
                    physics_group, prep_id, block_name
             FROM files
             WHERE das_id = ? AND status = 'NOTUPLOADED' AND block_name IS NULL
             ORDER BY lfn",
        )?;
        let rows = stmt.query_map(params![das_id], Self::file_from_row)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Workflows whose upstream signaled completion.
    pub fn get_completed_workflows(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM workflows WHERE completed")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    fn file_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<StagedFile> {
        let locations: String = row.get(3)?;
        Ok(StagedFile {
            lfn: row.get(0)?,
            size: row.get(1)?,
            events: row.get(2)?,
            location: first_location(&locations),
            dataset_path: row.get(4)?,
            workflow: row.get(5)?,
            physics_group: row.get(6)?,
            prep_id: row.get(7)?,
            block: row.get(8)?,
        })
    }

    // ---- transactional writes --------------------------------------------
    //
    // All writes take the caller's session so one cycle commit stays one
    // clearly bounded transaction.

    pub fn create_blocks(tx: &Transaction<'_>, blocks: &[&Block]) -> Result<()> {
        let mut stmt = tx.prepare(
            "INSERT INTO blocks (name, das_id, location, workflow, status, create_time,
                                 max_files, max_events, max_size, max_age)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for block in blocks {
            stmt.execute(params![
                block.name,
                block.das_id,
                block.location,
                block.workflow,
                block.status.to_db(),
                block.create_time,
                block.limits.max_files,
                block.limits.max_events,
                block.limits.max_size,
                block.limits.max_age,
            ])?;
        }
        Ok(())
    }

    /// In upload-only mode the packing columns belong to the external
    /// producer, so only the status moves.
    pub fn update_blocks(tx: &Transaction<'_>, blocks: &[&Block], upload_only: bool) -> Result<()> {
        let query = if upload_only {
            "UPDATE blocks SET status = ? WHERE name = ?"
        } else {
            "UPDATE blocks SET status = ?, location = ? WHERE name = ?"
        };
        let mut stmt = tx.prepare(query)?;
        for block in blocks {
            if upload_only {
                stmt.execute(params![block.status.to_db(), block.name])?;
            } else {
                stmt.execute(params![block.status.to_db(), block.location, block.name])?;
            }
        }
        Ok(())
    }

    pub fn set_block_files(tx: &Transaction<'_>, binds: &[FileBlockBind]) -> Result<()> {
        let mut stmt = tx.prepare("UPDATE files SET block_name = ? WHERE lfn = ?")?;
        for bind in binds {
            stmt.execute(params![bind.block_name, bind.lfn])?;
        }
        Ok(())
    }

    pub fn update_file_status(
        tx: &Transaction<'_>,
        blocks: &[&Block],
        status: FileStatus,
    ) -> Result<()> {
        let mut stmt = tx.prepare("UPDATE files SET status = ? WHERE block_name = ?")?;
        for block in blocks {
            stmt.execute(params![status.to_db(), block.name])?;
        }
        Ok(())
    }

    // ---- producer side ---------------------------------------------------
    //
    // Upstream components record produced files here; the uploader only
    // reads them. Kept in the adapter so tests and tooling share one path.

    pub fn insert_dataset_algo(
        &self,
        id: i64,
        dataset_path: &str,
        acquisition_era: &str,
        processing_ver: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO dataset_algo (id, dataset_path, acquisition_era, processing_ver)
             VALUES (?, ?, ?, ?)",
            params![id, dataset_path, acquisition_era, processing_ver],
        )?;
        Ok(())
    }

    pub fn insert_files_bulk(&mut self, das_id: i64, files: &[StagedFile]) -> Result<usize> {
        let conn = &self.conn;
        let mut appender = conn.appender("files")?;
        for file in files {
            appender.append_row(params![
                file.lfn,
                das_id,
                file.size,
                file.events,
                file.location,
                file.dataset_path,
                file.workflow,
                file.physics_group,
                file.prep_id,
                file.block,
                "NOTUPLOADED",
            ])?;
        }
        Ok(files.len())
    }

    pub fn add_workflow(&self, name: &str, completed: bool) -> Result<()> {
        self.conn.execute(
            "INSERT INTO workflows (name, completed) VALUES (?, ?)",
            params![name, completed],
        )?;
        Ok(())
    }

    pub fn mark_workflow_completed(&self, name: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE workflows SET completed = TRUE WHERE name = ?",
            params![name],
        )?;
        Ok(())
    }

    // ---- inspection ------------------------------------------------------

    pub fn count_rows(&self, table: &str) -> Result<i64> {
        let count_query = format!("SELECT COUNT(*) FROM {}", table);
        let mut stmt = self.conn.prepare(&count_query)?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_rows_where(&self, table: &str, where_clause: &str) -> Result<i64> {
        let count_query = format!("SELECT COUNT(*) FROM {} WHERE {}", table, where_clause);
        let mut stmt = self.conn.prepare(&count_query)?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count)
    }

    pub fn get_block_status(&self, name: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status FROM blocks WHERE name = ?")?;
        let mut rows = stmt.query_map(params![name], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// (block assignment, file status) of one lfn
    pub fn get_file_assignment(&self, lfn: &str) -> Result<Option<(Option<String>, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT block_name, status FROM files WHERE lfn = ?")?;
        let mut rows = stmt.query_map(params![lfn], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?))
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn get_column_names(&self, query: &str) -> Result<Vec<String>> {
        let schema_query = format!("DESCRIBE {}", query);
        let mut stmt = self.conn.prepare(&schema_query)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut column_names = Vec::new();
        for row in rows {
            column_names.push(row?);
        }
        Ok(column_names)
    }

    /// Dump a query as JSON rows. The schema here is all scalars, so only
    /// scalar value types are mapped.
    pub fn query_to_json(&self, query: &str) -> Result<Vec<Value>> {
        let column_names = self.get_column_names(query)?;
        let mut stmt = self.conn.prepare(query)?;

        let rows = stmt.query_map([], |row| {
            let mut json_row = serde_json::Map::new();
            for (i, column_name) in column_names.iter().enumerate() {
                let value: Value = match row.get_ref(i)? {
                    duckdb::types::ValueRef::Null => Value::Null,
                    duckdb::types::ValueRef::Boolean(v) => json!(v),
                    duckdb::types::ValueRef::TinyInt(v) => json!(v),
                    duckdb::types::ValueRef::SmallInt(v) => json!(v),
                    duckdb::types::ValueRef::Int(v) => json!(v),
                    duckdb::types::ValueRef::BigInt(v) => json!(v),
                    duckdb::types::ValueRef::UBigInt(v) => json!(v),
                    duckdb::types::ValueRef::Float(v) => json!(v),
                    duckdb::types::ValueRef::Double(v) => json!(v),
                    duckdb::types::ValueRef::Text(v) => match std::str::from_utf8(v) {
                        Ok(decoded) => json!(decoded),
                        Err(_) => json!(v),
                    },
                    other => json!(format!("unsupported: {:?}", other)),
                };
                json_row.insert(column_name.to_string(), value);
            }
            Ok(Value::Object(json_row))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn print_table(&self, table: &str) -> Result<()> {
        let limit = 10;
        self.print_table_with_limit(table, limit)?;
        Ok(())
    }

    pub fn print_table_with_limit(&self, table: &str, limit: i32) -> Result<()> {
        let query = format!("SELECT * FROM {} LIMIT {}", table, limit);
        let results = self.query_to_json(&query)?;
        print_json_objects_as_table(&results);
        Ok(())
    }
}
