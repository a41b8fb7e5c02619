//! JSON-lines transport: one `InboundEvent` per input line, one
//! `OutboundEvent` per output line.

use survey_coordination::{EventReceiver, InboundEvent, SurveySession};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode outbound event: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Parse one input line. Blank lines carry no event.
pub fn parse_line(line: &str) -> Result<Option<InboundEvent>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Feed every line of `reader` to the session until EOF.
///
/// Malformed lines are logged and skipped. Returns the number of events
/// handed to the session.
pub async fn read_events<R>(reader: R, session: &SurveySession) -> TransportResult<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut handled = 0;
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        match parse_line(&line) {
            Ok(Some(event)) => {
                session.handle_inbound(event);
                handled += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(line = line_no, error = %e, "Skipping malformed inbound event"),
        }
    }
    debug!(lines = line_no, handled, "Inbound stream closed");
    Ok(handled)
}

/// Write outbound events as JSON lines until every sender is gone.
pub async fn write_events<W>(mut events: EventReceiver, mut writer: W) -> TransportResult<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(event) = events.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        written += 1;
    }
    Ok(written)
}
