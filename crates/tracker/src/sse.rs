// crates/tracker/src/sse.rs
//! Incremental parser for `text/event-stream` bodies.
//!
//! Feed raw transport chunks to [`EventStreamParser::push`]; completed
//! records come back out. A record ends at a blank line. Within a record,
//! `event:` names the event (defaulting to `message`) and each `data:`
//! line contributes one payload line; multiple `data:` lines are joined
//! with `\n`. Comment lines (leading `:`) and unknown fields are skipped.
//! A record that carries no data dispatches nothing.
//!
//! The parser never filters by event name; delivering unrecognized names
//! is the subscriber's problem.

/// One dispatched server event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub name: String,
    pub data: String,
}

const DEFAULT_EVENT: &str = "message";

#[derive(Debug, Default)]
pub struct EventStreamParser {
    /// Unconsumed bytes. A chunk may end mid-line or mid-UTF-8 sequence,
    /// so the buffer is only ever cut at `\n`.
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one transport chunk, returning every record it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ServerEvent> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut consumed = 0;
        while let Some(nl) = self.buf[consumed..].iter().position(|&b| b == b'\n') {
            let end = consumed + nl;
            let mut line = &self.buf[consumed..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            consumed = end + 1;
            if let Some(record) = self.handle_line(&line) {
                out.push(record);
            }
        }
        self.buf.drain(..consumed);
        out
    }

    fn handle_line(&mut self, line: &str) -> Option<ServerEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id, retry and anything else play no role for job updates.
            _ => {}
        }
        None
    }

    /// Blank line: emit the pending record if it carries any data. The
    /// event name resets either way.
    fn dispatch(&mut self) -> Option<ServerEvent> {
        let name = self
            .event
            .take()
            .unwrap_or_else(|| DEFAULT_EVENT.to_string());
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(ServerEvent { name, data })
    }
}
