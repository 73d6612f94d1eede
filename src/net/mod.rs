//! Remote worker wire protocol.
//!
//! Workers report terminal command state back over a short-lived TCP
//! connection carrying one line: `<command-id> <tag> [diagnostic…]`. The
//! legacy string tags are the wire contract and are preserved as-is; they are
//! decoded into [`RemoteOutcome`] immediately on receipt and never handled as
//! strings past this module.

pub mod listener;
pub mod transport;

pub use listener::{CompletionListener, ReportHandler};
pub use transport::{RemoteTransport, TcpTransport};

use crate::store::CommandId;

/// Success tag on the completion wire.
pub const TAG_SUCCESS: &str = "Termine";
/// Failure tag on the completion wire.
pub const TAG_FAILURE: &str = "En_Erreur";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    Success,
    Failure { reason: String },
}

/// Decode one completion report line. Returns None on malformed input; the
/// caller logs and discards.
pub fn parse_report(line: &str) -> Option<(CommandId, RemoteOutcome)> {
    let mut parts = line.trim().splitn(3, ' ');
    let id: CommandId = parts.next()?.parse().ok()?;
    let tag = parts.next()?;
    let diagnostic = parts.next().unwrap_or("").trim();

    let outcome = match tag {
        TAG_SUCCESS => RemoteOutcome::Success,
        TAG_FAILURE => RemoteOutcome::Failure {
            reason: if diagnostic.is_empty() {
                "remote worker reported failure".to_string()
            } else {
                diagnostic.to_string()
            },
        },
        _ => return None,
    };
    Some((id, outcome))
}
