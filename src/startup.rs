//! Progress output shown to clients while the backend boots
//!
//! A [`StartupSession`] is an append-only log of text chunks with a terminal
//! [`Outcome`]. Every request that arrives while the backend is booting gets
//! its own [`StartupStream`] over the same session, starting from the first
//! chunk, and the response body ends once the session is closed and the
//! reader has drained everything appended before the close.

use futures::stream::{self, Stream, StreamExt};
use hyper::body::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Upper bound on text kept per session
pub const MAX_SESSION_BYTES: usize = 256 * 1024;

const TRUNCATED_MARKER: &str = "[output truncated]\n";

/// How a boot ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The backend is live; clients should reload
    Ready,
    /// The boot failed with the given message
    Failed(String),
    /// The backend was stopped before it became ready
    Stopped,
}

#[derive(Default)]
struct SessionLog {
    chunks: Vec<String>,
    bytes: usize,
    truncated: bool,
    /// Last chunk did not end with a line break (progress dots)
    mid_line: bool,
    outcome: Option<Outcome>,
}

struct SessionInner {
    log: Mutex<SessionLog>,
    changed: watch::Sender<u64>,
    readers: AtomicUsize,
}

/// Shared progress log for one activation of the backend
#[derive(Clone)]
pub struct StartupSession {
    inner: Arc<SessionInner>,
}

impl Default for StartupSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StartupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.inner.log.lock();
        f.debug_struct("StartupSession")
            .field("chunks", &log.chunks.len())
            .field("bytes", &log.bytes)
            .field("outcome", &log.outcome)
            .finish()
    }
}

impl StartupSession {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(SessionInner {
                log: Mutex::new(SessionLog::default()),
                changed,
                readers: AtomicUsize::new(0),
            }),
        }
    }

    /// Append `text` on a line of its own
    pub fn append_line(&self, text: &str) {
        let mut line = strip_ansi(text);
        line.push('\n');
        self.push(line, true);
    }

    /// Append `text` as-is (progress dots, raw output)
    pub fn append_chunk(&self, text: &str) {
        self.push(strip_ansi(text), false);
    }

    fn push(&self, mut text: String, own_line: bool) {
        if text.is_empty() {
            return;
        }
        {
            let mut log = self.inner.log.lock();
            if log.outcome.is_some() || log.truncated {
                return;
            }
            if own_line && log.mid_line {
                text.insert(0, '\n');
            }
            log.mid_line = !text.ends_with('\n');
            if log.bytes + text.len() > MAX_SESSION_BYTES {
                log.truncated = true;
                log.bytes += TRUNCATED_MARKER.len();
                log.chunks.push(TRUNCATED_MARKER.to_string());
            } else {
                log.bytes += text.len();
                log.chunks.push(text);
            }
        }
        self.notify();
    }

    /// Mark the session finished. Only the first close takes effect.
    pub fn close(&self, outcome: Outcome) {
        {
            let mut log = self.inner.log.lock();
            if log.outcome.is_some() {
                return;
            }
            log.outcome = Some(outcome);
        }
        self.notify();
    }

    fn notify(&self) {
        self.inner.changed.send_modify(|version| *version += 1);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.log.lock().outcome.is_some()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.log.lock().outcome.clone()
    }

    /// Everything appended so far, concatenated
    pub fn text(&self) -> String {
        self.inner.log.lock().chunks.concat()
    }

    /// Number of live readers
    pub fn reader_count(&self) -> usize {
        self.inner.readers.load(Ordering::SeqCst)
    }

    /// Open a reader positioned at the first chunk
    pub fn subscribe(&self) -> StartupStream {
        self.inner.readers.fetch_add(1, Ordering::SeqCst);
        StartupStream {
            session: self.clone(),
            rx: self.inner.changed.subscribe(),
            cursor: 0,
        }
    }
}

/// One client's view of a [`StartupSession`]
pub struct StartupStream {
    session: StartupSession,
    rx: watch::Receiver<u64>,
    cursor: usize,
}

impl StartupStream {
    /// Next batch of text, or `None` once the session is closed and drained
    pub async fn next_chunk(&mut self) -> Option<String> {
        loop {
            // Mark the current version seen before looking at the log so an
            // append racing with the read still wakes us below.
            self.rx.borrow_and_update();
            {
                let log = self.session.inner.log.lock();
                if self.cursor < log.chunks.len() {
                    let text = log.chunks[self.cursor..].concat();
                    self.cursor = log.chunks.len();
                    return Some(text);
                }
                if log.outcome.is_some() {
                    return None;
                }
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn session(&self) -> &StartupSession {
        &self.session
    }

    pub fn into_stream(self) -> impl Stream<Item = String> + Send {
        stream::unfold(self, |mut reader| async move {
            reader.next_chunk().await.map(|chunk| (chunk, reader))
        })
    }
}

impl Drop for StartupStream {
    fn drop(&mut self) {
        let remaining = self.session.inner.readers.fetch_sub(1, Ordering::SeqCst) - 1;
        if !self.session.is_closed() {
            debug!(remaining, "Startup stream consumer went away before boot finished");
        }
    }
}

const HTML_PREAMBLE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<title>Please wait...</title>\
<style>body{font-family:sans-serif;margin:2rem}pre{white-space:pre-wrap}.error{color:#b00}</style>\
</head><body><p>Please wait...</p><pre>";

/// Render a reader as an HTML progress page
pub fn render_html(reader: StartupStream) -> impl Stream<Item = Bytes> + Send {
    let session = reader.session().clone();
    let preamble = stream::once(async { Bytes::from_static(HTML_PREAMBLE.as_bytes()) });
    let body = reader
        .into_stream()
        .map(|chunk| Bytes::from(escape_html(&chunk)));
    let epilogue = stream::once(async move { Bytes::from(html_epilogue(session.outcome())) });

    preamble.chain(body).chain(epilogue)
}

fn html_epilogue(outcome: Option<Outcome>) -> String {
    match outcome {
        Some(Outcome::Ready) => {
            "</pre><p>Ready.</p><script>location.reload()</script></body></html>".to_string()
        }
        Some(Outcome::Failed(message)) => format!(
            "</pre><p class=\"error\">{}</p><p><a href=\"\">Try again</a></p></body></html>",
            escape_html(&message)
        ),
        Some(Outcome::Stopped) | None => {
            "</pre><p>Stopped.</p><p><a href=\"\">Try again</a></p></body></html>".to_string()
        }
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Remove ANSI CSI (`ESC [ ... final`) and OSC (`ESC ] ... BEL|ST`) sequences
pub fn strip_ansi(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for nc in chars.by_ref() {
                    if ('@'..='~').contains(&nc) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(nc) = chars.next() {
                    if nc == '\x07' {
                        break;
                    }
                    if nc == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) => {
                // Two-character escape
                chars.next();
            }
            None => {}
        }
    }
    result
}
