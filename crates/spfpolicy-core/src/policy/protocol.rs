//! Policy delegation protocol
//!
//! Requests are `name=value` lines terminated by an empty line. Responses
//! are `action=...` lines, likewise terminated by an empty line.

use super::decision::PolicyDecision;
use spfpolicy_common::ClientRequest;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Longest request line kept, in bytes; the remainder is discarded
pub const MAX_LINE_LEN: u64 = 8192;

/// Result of reading one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete transaction
    Request(ClientRequest),
    /// A complete transaction lacking a required attribute
    Malformed {
        request: ClientRequest,
        missing: &'static str,
    },
    /// The MTA closed the stream
    EndOfSession,
}

/// Read the attributes of the next transaction
pub async fn read_request<R>(reader: &mut R, debug_level: u8) -> std::io::Result<ReadOutcome>
where
    R: AsyncBufRead + Unpin,
{
    let mut request = ClientRequest::default();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        if read_line(reader, &mut raw).await? == 0 {
            if request.attribute_count() > 0 {
                warn!("Discarding incomplete request at end of stream ({})", request);
            }
            return Ok(ReadOutcome::EndOfSession);
        }

        let text = String::from_utf8_lossy(&raw);
        let line = text.trim_end_matches(['\r', '\n']);
        if debug_level > 1 {
            debug!("--> {}", line);
        }

        if line.is_empty() {
            if request.attribute_count() == 0 {
                continue;
            }
            return Ok(match request.missing_required() {
                Some(missing) => ReadOutcome::Malformed { request, missing },
                None => ReadOutcome::Request(request),
            });
        }

        let Some(slot) = attribute_slot(&mut request, line) else {
            // Ignore line
            continue;
        };
        let (_, value) = line.split_at(slot.0);
        *slot.1 = Some(value.to_string());
        if debug_level > 1 {
            debug!("[{} {}]", &line[..slot.0 - 1], value);
        }
    }
}

/// Read one line of at most `MAX_LINE_LEN` bytes
///
/// Bytes past the limit are skipped up to the next newline.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader).take(MAX_LINE_LEN).read_until(b'\n', buf).await?;
    if n as u64 == MAX_LINE_LEN && buf.last() != Some(&b'\n') {
        warn!("Truncating request line longer than {} bytes", MAX_LINE_LEN);
        let mut rest = Vec::new();
        loop {
            rest.clear();
            let skipped = (&mut *reader)
                .take(MAX_LINE_LEN)
                .read_until(b'\n', &mut rest)
                .await?;
            if skipped == 0 || rest.last() == Some(&b'\n') {
                break;
            }
        }
    }
    Ok(n)
}

/// Match a recognized attribute name, case-insensitively
///
/// Returns the offset of the value and the field it belongs in.
fn attribute_slot<'a>(
    request: &'a mut ClientRequest,
    line: &str,
) -> Option<(usize, &'a mut Option<String>)> {
    const KEYS: [&str; 4] = ["client_address=", "sender=", "helo_name=", "recipient="];

    let idx = KEYS.iter().position(|key| {
        line.get(..key.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(key))
    })?;

    let field = match idx {
        0 => &mut request.ip,
        1 => &mut request.sender,
        2 => &mut request.helo,
        _ => &mut request.rcpt_to,
    };
    Some((KEYS[idx].len(), field))
}

/// Write a decision and flush it to the MTA
pub async fn write_decision<W>(writer: &mut W, decision: &PolicyDecision) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(decision.to_wire().as_bytes()).await?;
    writer.flush().await
}
