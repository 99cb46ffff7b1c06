//! Bootstrap of [`deposit_desk`](crate) for the binary: configuration, logging,
//! user seeding and a line-oriented stand-in for the chat transport.

use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::desk::{Desk, Reply};
use crate::error::{DeskError, ErrorKind};
use crate::models::UserId;
use crate::notify::TracingNotifier;
use crate::runtime::Shutdown;
use crate::store::in_memory::InMemoryStore;
use csv_parser::CsvUserParser;
use csv_printer::print_pending;

pub mod config;
pub mod csv_parser;
pub mod csv_printer;
pub mod logging;

/// Wires a desk with the in-memory store and live upstream clients.
pub fn build_desk(config: &config::DeskConfig) -> Result<Desk> {
    let settings = config.settings()?;
    let deriver = Arc::new(config.key.deriver()?);
    let client = config.rates.http_client()?;
    tracing::info!(
        network = %deriver.network(),
        admin_id = settings.admin_id,
        explorer = %config.explorer_url,
        "starting desk"
    );
    Ok(Desk::new(
        Arc::new(InMemoryStore::new()),
        deriver,
        Arc::new(config.explorer(&client)),
        Arc::new(config.rates.rate_service(&client)),
        Arc::new(TracingNotifier),
        settings,
    ))
}

/// Registers every user of a `user,card_number` CSV list.
pub fn import_users<R>(desk: &Desk, source: R) -> Result<usize>
where
    R: Read,
{
    let mut imported = 0;
    for (line, row) in CsvUserParser::new(source) {
        let row = row.with_context(|| format!("Malformed user row at line {line}"))?;
        desk.register(row.user, row.card_number.as_deref())
            .with_context(|| format!("Cannot register user at line {line}"))?;
        imported += 1;
    }
    tracing::info!(imported, "users imported");
    Ok(imported)
}

#[derive(Debug, Error)]
pub enum LineError {
    #[error("expected `<user_id> <message>`, got `{0}`")]
    Malformed(String),
}

/// Feeds `<user_id> <message>` lines to the desk and writes each reply as
/// `[<user_id>] <reply>`. Pending-withdrawal listings are written as CSV.
pub struct Service<'w, R, W: 'w> {
    pub desk: Arc<Desk>,
    pub input: R,
    pub output: &'w mut W,
    pub error_printer: Box<dyn FnMut(u64, LineError) + Send>,
    pub shutdown: Shutdown,
}

impl<'w, R, W> Service<'w, R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + 'w,
{
    pub async fn run(mut self) -> Result<()> {
        let mut stop = self.shutdown.subscribe();
        let mut lines = self.input.lines();
        let mut line_no = 0u64;

        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            let line = tokio::select! {
                line = lines.next_line() => line.context("Failed to read input")?,
                _ = stop.recv() => break,
            };
            let Some(line) = line else {
                break;
            };
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let Some((user_id, message)) = split_line(&line) else {
                (self.error_printer)(line_no, LineError::Malformed(line));
                continue;
            };
            let rendered = match self.desk.handle_message(user_id, message).await {
                Ok(reply) => render(user_id, &reply)?,
                Err(err) => {
                    log_rejection(user_id, &err);
                    format!("[{user_id}] {err}\n")
                }
            };
            self.output
                .write_all(rendered.as_bytes())
                .await
                .context("Failed to write reply")?;
        }
        self.output.flush().await.context("Failed to flush output")?;
        Ok(())
    }
}

fn split_line(line: &str) -> Option<(UserId, &str)> {
    let (user, message) = line.trim().split_once(char::is_whitespace)?;
    let user_id = user.parse().ok()?;
    Some((user_id, message.trim()))
}

fn render(user_id: UserId, reply: &Reply) -> Result<String> {
    match reply {
        Reply::Text(text) => Ok(format!("[{user_id}] {text}\n")),
        Reply::Pending(page) => {
            let mut csv = Vec::new();
            print_pending(&mut csv, page)?;
            let csv = String::from_utf8(csv).context("CSV output is not UTF-8")?;
            Ok(format!(
                "[{user_id}] page {} of {}\n{csv}",
                page.page + 1,
                page.pages
            ))
        }
    }
}

fn log_rejection(user_id: UserId, err: &DeskError) {
    match err.kind() {
        ErrorKind::ConsistencyViolation => {
            // already reported on the consistency target where it was raised
        }
        ErrorKind::Internal | ErrorKind::UpstreamUnavailable => {
            tracing::error!(user_id, error = %err, "request failed")
        }
        _ => tracing::debug!(user_id, error = %err, "request rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_user_and_message() {
        assert_eq!(split_line("42 /balance"), Some((42, "/balance")));
        assert_eq!(split_line("  7   1500,50 "), Some((7, "1500,50")));
        assert_eq!(split_line("/balance"), None);
        assert_eq!(split_line("abc /balance"), None);
    }
}
