//! Read-buffer size benchmark core
//!
//! One client per buffer size, a one-off table of 1,000,000 rows and a loop
//! that pulls every row of `SELECT * FROM t` through the client. The
//! criterion entry point in `benches/buffer_size.rs` drives these functions.

use crate::client::{
    Client,
    ClientOptions,
};
use crate::query::RowValues;
use crate::{
    Error,
    Result,
};
use tracing::{
    debug,
    info,
};

/// Table scanned by the benchmark
pub const TABLE_NAME: &str = "t";

/// Number of rows the setup statement generates
pub const TABLE_ROWS: u64 = 1_000_000;

/// Creates and fills `t` on first use; a no-op (plus a notice) afterwards
pub const SETUP_SQL: &str = "CREATE TABLE IF NOT EXISTS t AS (SELECT generate_series(1, 1000000) AS id, md5(random()::text) AS \"desc\")";

/// The measured query
pub const SELECT_SQL: &str = "SELECT * FROM t";

pub const COUNT_SQL: &str = "SELECT count(*) FROM t";

/// A labelled read-buffer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSize {
    pub label: &'static str,
    pub kb: usize,
}

impl BufferSize {
    pub const fn new(label: &'static str, kb: usize) -> Self {
        Self { label, kb }
    }

    pub const fn bytes(&self) -> usize {
        self.kb * 1024
    }
}

/// Configurations benchmarked, in run order
pub const BUFFER_SIZES: [BufferSize; 4] = [
    BufferSize::new("4KB", 4),
    BufferSize::new("8KB", 8),
    BufferSize::new("16KB", 16),
    BufferSize::new("1MB", 1024),
];

/// Connect using `PG_URL` with a minimum read buffer of `kb` KiB.
///
/// Fails with [`Error::Config`] before touching the network when `PG_URL`
/// is unset or empty.
pub async fn connect(kb: usize) -> Result<Client> {
    let options = ClientOptions::from_env()?;
    connect_with(&options, kb).await
}

/// Connect with a copy of `base` whose minimum read buffer is `kb` KiB
pub async fn connect_with(base: &ClientOptions, kb: usize) -> Result<Client> {
    if kb == 0 {
        return Err(Error::InvalidArgument(
            "Read buffer size must be at least 1 KB".to_string(),
        ));
    }
    let bytes = kb.checked_mul(1024).ok_or_else(|| {
        Error::InvalidArgument(format!("Read buffer size of {} KB is too large", kb))
    })?;

    let options = base.clone().min_read_buffer_size(bytes);
    let client = Client::connect(options).await?;
    debug!(kb, read_buffer = client.min_read_buffer_size(), "Benchmark client ready");
    Ok(client)
}

/// Create and populate `t` unless it already exists
pub async fn setup_db(client: &mut Client) -> Result<()> {
    info!(table = TABLE_NAME, rows = TABLE_ROWS, "Preparing benchmark table");
    let results = client.exec(SETUP_SQL).await?.read_all().await?;
    for result in &results {
        debug!(tag = %result.command_tag, "Setup statement complete");
    }
    Ok(())
}

/// Outcome of draining one query execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fetch {
    /// Values of the last row seen; empty when no row was returned
    pub last: RowValues,
    /// Rows read across all result sets
    pub rows: u64,
    /// Result sets traversed, including ones without rows
    pub result_sets: usize,
}

/// Run `sql` and read every row of every result set, keeping the last one
pub async fn fetch_last_row(client: &mut Client, sql: &str) -> Result<Fetch> {
    let mut fetch = Fetch::default();
    let mut mrr = client.exec(sql).await?;

    while let Some(mut rr) = mrr.next_result().await? {
        fetch.result_sets += 1;
        while rr.next_row().await? {
            fetch.rows += 1;
            rr.swap_values(&mut fetch.last);
        }
    }

    Ok(fetch)
}

/// One iteration of the benchmark: `SELECT * FROM t` fully drained
pub async fn select_rows(client: &mut Client) -> Result<RowValues> {
    Ok(fetch_last_row(client, SELECT_SQL).await?.last)
}

/// Run [`select_rows`] `iters` times and return the final row
pub async fn select_bench(client: &mut Client, iters: u64) -> Result<RowValues> {
    let mut last = RowValues::new();
    for _ in 0..iters {
        last = select_rows(client).await?;
    }
    Ok(last)
}

/// Current number of rows in `t`
pub async fn row_count(client: &mut Client) -> Result<u64> {
    let fetch = fetch_last_row(client, COUNT_SQL).await?;
    let value = fetch
        .last
        .first()
        .and_then(|v| v.as_ref())
        .ok_or_else(|| Error::Protocol("count(*) returned no value".to_string()))?;

    let text = std::str::from_utf8(value)?;
    text.parse()
        .map_err(|_| Error::Protocol(format!("Invalid count(*) value: {:?}", text)))
}
