//! Client command model and pipeline coalescing.
//!
//! Runs of identical single-key GETs (or three-token SETs) buffered on a
//! client connection collapse into one synthetic PLGET/PLSET command, which
//! the dispatcher rewrites to MGET/MSET on the upstream wire.

use std::borrow::Cow;
use std::collections::VecDeque;

use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;

/// One parsed client command: verb plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub args: Vec<Bytes>,
}

impl Command {
    /// Lower-cased verb.
    pub fn verb(&self) -> Cow<'static, str> {
        qcmd_lower(self.args.first().map(|a| a.as_ref()).unwrap_or_default())
    }

    /// Render the command as a RESP array of bulk strings.
    pub fn to_frame(&self) -> BytesFrame {
        BytesFrame::Array(
            self.args
                .iter()
                .map(|a| BytesFrame::BulkString(a.clone()))
                .collect(),
        )
    }

    /// Render the command with the verb swapped, e.g. PLGET → MGET.
    pub fn to_frame_with_verb(&self, verb: &'static [u8]) -> BytesFrame {
        let mut parts = Vec::with_capacity(self.args.len());
        parts.push(BytesFrame::BulkString(Bytes::from_static(verb)));
        parts.extend(
            self.args
                .iter()
                .skip(1)
                .map(|a| BytesFrame::BulkString(a.clone())),
        );
        BytesFrame::Array(parts)
    }
}

/// Decode a client frame into a command. Empty arrays decode to `None`.
pub fn parse_command(frame: BytesFrame) -> anyhow::Result<Option<Command>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    if parts.is_empty() {
        return Ok(None);
    }

    let mut args = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => args.push(b),
            _ => anyhow::bail!("invalid command argument"),
        }
    }
    Ok(Some(Command { args }))
}

/// ASCII-lowercase a command verb, allocation-free for the verbs the
/// dispatcher inspects on every request.
pub fn qcmd_lower(n: &[u8]) -> Cow<'static, str> {
    match n.len() {
        3 => {
            if n.eq_ignore_ascii_case(b"get") {
                return Cow::Borrowed("get");
            }
            if n.eq_ignore_ascii_case(b"set") {
                return Cow::Borrowed("set");
            }
        }
        4 => {
            if n.eq_ignore_ascii_case(b"mget") {
                return Cow::Borrowed("mget");
            }
            if n.eq_ignore_ascii_case(b"mset") {
                return Cow::Borrowed("mset");
            }
            if n.eq_ignore_ascii_case(b"eval") {
                return Cow::Borrowed("eval");
            }
        }
        5 => {
            if n.eq_ignore_ascii_case(b"plget") {
                return Cow::Borrowed("plget");
            }
            if n.eq_ignore_ascii_case(b"plset") {
                return Cow::Borrowed("plset");
            }
        }
        6 => {
            if n.eq_ignore_ascii_case(b"evalro") {
                return Cow::Borrowed("evalro");
            }
        }
        _ => {}
    }
    Cow::Owned(String::from_utf8_lossy(n).to_ascii_lowercase())
}

/// Collapse a uniform buffered run into one synthetic multi-key command.
///
/// `pending` holds frames already read off the connection. When the current
/// command and every pending command are single-key GETs, everything merges
/// into `PLGET k1 .. kN`; the analogous rule turns `SET key value` runs into
/// `PLSET k1 v1 ..`. Anything non-uniform leaves the pipeline untouched.
///
/// Returns the number of client commands consumed (0 when unchanged) and
/// the command to dispatch.
pub fn coalesce(cmd: Command, pending: &mut VecDeque<BytesFrame>) -> (usize, Command) {
    if pending.is_empty() {
        return (0, cmd);
    }

    let verb = cmd.verb();
    let (want_len, synthetic): (usize, &'static [u8]) = match verb.as_ref() {
        "get" => (2, b"plget"),
        "set" => (3, b"plset"),
        _ => return (0, cmd),
    };
    if cmd.args.len() != want_len {
        return (0, cmd);
    }
    if !pending
        .iter()
        .all(|frame| is_uniform(frame, verb.as_ref(), want_len))
    {
        return (0, cmd);
    }

    let consumed = pending.len() + 1;
    let mut args = Vec::with_capacity(1 + consumed * (want_len - 1));
    args.push(Bytes::from_static(synthetic));
    args.extend(cmd.args[1..].iter().cloned());
    while let Some(BytesFrame::Array(parts)) = pending.pop_front() {
        for part in parts.into_iter().skip(1) {
            match part {
                BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => args.push(b),
                _ => {}
            }
        }
    }

    (consumed, Command { args })
}

fn is_uniform(frame: &BytesFrame, verb: &str, want_len: usize) -> bool {
    let BytesFrame::Array(parts) = frame else {
        return false;
    };
    if parts.len() != want_len {
        return false;
    }
    let Some(BytesFrame::BulkString(head) | BytesFrame::SimpleString(head)) = parts.first() else {
        return false;
    };
    if qcmd_lower(head) != verb {
        return false;
    }
    parts
        .iter()
        .skip(1)
        .all(|p| matches!(p, BytesFrame::BulkString(_) | BytesFrame::SimpleString(_)))
}
