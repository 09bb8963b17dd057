//! Streaming access to the results of a simple query
//!
//! A query string may hold several statements, so one execution yields a
//! sequence of result sets. [`MultiResultReader`] walks the sequence and
//! [`ResultReader`] walks the rows of one result set. Both must be driven to
//! the end (or closed) before the client accepts another query.

use crate::{
    client::Client,
    error::ServerError,
    wire_format::{
        decode_data_row,
        BackendMessage,
        FieldDescription,
    },
    Error,
    Result,
};
use bytes::Bytes;
use std::fmt;
use tracing::debug;

/// Column values of one row; `None` is SQL NULL
pub type RowValues = Vec<Option<Bytes>>;

/// Completion tag of a statement, e.g. `SELECT 1000000`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTag(String);

impl CommandTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Row count carried by the tag (`SELECT 5`, `INSERT 0 5`, `UPDATE 5`)
    pub fn rows_affected(&self) -> Option<u64> {
        let mut parts = self.0.split_whitespace();
        let command = parts.next()?;
        let count = parts.last()?;
        match command {
            "SELECT" | "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "MOVE" | "FETCH" | "COPY" => {
                count.parse().ok()
            }
            _ => None,
        }
    }

}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully buffered result set, produced by [`MultiResultReader::read_all`]
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub fields: Vec<FieldDescription>,
    pub rows: Vec<RowValues>,
    pub command_tag: CommandTag,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.fields.len()
    }
}

/// Cursor over the result sets of one query execution
pub struct MultiResultReader<'a> {
    client: &'a mut Client,
    fields: Vec<FieldDescription>,
    values: RowValues,
    command_tag: Option<CommandTag>,
    rows_read: u64,
    in_result: bool,
    done: bool,
}

impl<'a> MultiResultReader<'a> {
    pub(crate) fn new(client: &'a mut Client) -> Self {
        Self {
            client,
            fields: Vec::new(),
            values: Vec::new(),
            command_tag: None,
            rows_read: 0,
            in_result: false,
            done: false,
        }
    }

    /// Advance to the next result set.
    ///
    /// Unread rows of the current result set are skipped. Returns `None`
    /// once the server reports ReadyForQuery.
    pub async fn next_result(&mut self) -> Result<Option<ResultReader<'_, 'a>>> {
        if self.done {
            return Ok(None);
        }
        while self.in_result {
            self.read_row().await?;
        }

        loop {
            match self.client.read_message().await? {
                BackendMessage::RowDescription(fields) => {
                    debug!(columns = fields.len(), "Result set started");
                    self.start_result(fields, true);
                    return Ok(Some(ResultReader { mrr: self }));
                }
                BackendMessage::CommandComplete(tag) => {
                    // Statement without a row set (DDL, INSERT without RETURNING, ...)
                    self.start_result(Vec::new(), false);
                    self.command_tag = Some(tag);
                    return Ok(Some(ResultReader { mrr: self }));
                }
                BackendMessage::EmptyQueryResponse => {}
                BackendMessage::ReadyForQuery(status) => {
                    self.client.ready(status);
                    self.done = true;
                    return Ok(None);
                }
                BackendMessage::ErrorResponse(err) => return self.fail(err).await,
                other => return Err(unexpected(&other)),
            }
        }
    }

    /// Drain every result set into memory
    pub async fn read_all(mut self) -> Result<Vec<QueryResult>> {
        let mut results = Vec::new();

        while let Some(mut rr) = self.next_result().await? {
            let mut rows = Vec::new();
            while rr.next_row().await? {
                rows.push(rr.values().to_vec());
            }
            results.push(QueryResult {
                fields: rr.fields().to_vec(),
                rows,
                command_tag: rr.command_tag().cloned().unwrap_or_default(),
            });
        }

        Ok(results)
    }

    /// Discard whatever is left of the execution
    pub async fn close(mut self) -> Result<()> {
        while self.next_result().await?.is_some() {}
        Ok(())
    }

    fn start_result(&mut self, fields: Vec<FieldDescription>, has_rows: bool) {
        self.fields = fields;
        self.values.clear();
        self.command_tag = None;
        self.rows_read = 0;
        self.in_result = has_rows;
    }

    async fn read_row(&mut self) -> Result<bool> {
        if !self.in_result {
            return Ok(false);
        }

        match self.client.read_message().await? {
            BackendMessage::DataRow(body) => {
                decode_data_row(&body, &mut self.values)?;
                self.rows_read += 1;
                Ok(true)
            }
            BackendMessage::CommandComplete(tag) => {
                debug!(tag = %tag, rows = self.rows_read, "Result set complete");
                self.values.clear();
                self.command_tag = Some(tag);
                self.in_result = false;
                Ok(false)
            }
            BackendMessage::ErrorResponse(err) => self.fail(err).await,
            other => Err(unexpected(&other)),
        }
    }

    /// Consume the rest of the execution so the connection stays usable,
    /// then report the server error.
    async fn fail<T>(&mut self, err: ServerError) -> Result<T> {
        debug!(code = %err.code, "Server error, draining to ReadyForQuery");
        self.in_result = false;
        self.values.clear();

        loop {
            if let BackendMessage::ReadyForQuery(status) = self.client.read_message().await? {
                self.client.ready(status);
                self.done = true;
                return Err(Error::Server(err));
            }
        }
    }
}

/// Cursor over the rows of one result set
pub struct ResultReader<'r, 'a> {
    mrr: &'r mut MultiResultReader<'a>,
}

impl ResultReader<'_, '_> {
    /// Column layout; empty for statements that return no rows
    pub fn fields(&self) -> &[FieldDescription] {
        &self.mrr.fields
    }

    /// Advance to the next row. Returns `false` when the result set is done.
    pub async fn next_row(&mut self) -> Result<bool> {
        self.mrr.read_row().await
    }

    /// Values of the current row, valid until the next call to `next_row`
    pub fn values(&self) -> &[Option<Bytes>] {
        &self.mrr.values
    }

    /// Exchange the current row's values with `out`.
    ///
    /// Hands the row over without copying; afterwards [`values`](Self::values)
    /// holds whatever `out` held until the next row replaces it.
    pub fn swap_values(&mut self, out: &mut RowValues) {
        std::mem::swap(&mut self.mrr.values, out);
    }

    /// Rows read so far from this result set
    pub fn rows_read(&self) -> u64 {
        self.mrr.rows_read
    }

    /// Tag of the finished statement; `None` until every row has been read
    pub fn command_tag(&self) -> Option<&CommandTag> {
        self.mrr.command_tag.as_ref()
    }

    /// Skip the remaining rows and return the command tag
    pub async fn close(self) -> Result<CommandTag> {
        while self.mrr.read_row().await? {}
        Ok(self.mrr.command_tag.clone().unwrap_or_default())
    }
}

fn unexpected(message: &BackendMessage) -> Error {
    Error::Protocol(format!("Unexpected message during query: {:?}", message))
}
