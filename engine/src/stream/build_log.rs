//! Build log broadcaster
//!
//! Lines are accumulated whether or not anyone listens. A subscriber gets the
//! accumulated history and then live lines, with no gap and no duplicate,
//! because the snapshot and the receiver are taken under the same lock that
//! appends. Live events carry their line index, so a subscriber that falls
//! behind the channel re-reads what it missed from the accumulated lines.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 1024;

/// Live build log event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// Line and its index in the log
    Line(usize, String),
    End,
}

struct LogState {
    lines: Vec<String>,
    finished: bool,
}

/// Append-only build log of one deployment
pub struct BuildLog {
    state: Mutex<LogState>,
    tx: broadcast::Sender<LogEvent>,
}

impl BuildLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(LogState {
                lines: Vec::new(),
                finished: false,
            }),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a line and fan it out to current subscribers
    pub fn append(&self, line: impl Into<String>) {
        let line = line.into();
        let mut state = self.lock();
        if state.finished {
            return;
        }
        let index = state.lines.len();
        state.lines.push(line.clone());
        // No receivers is fine, the line is already accumulated.
        let _ = self.tx.send(LogEvent::Line(index, line));
    }

    /// Close the log; subscribers see end-of-stream
    pub fn finish(&self) {
        let mut state = self.lock();
        if !state.finished {
            state.finished = true;
            let _ = self.tx.send(LogEvent::End);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Full text accumulated so far
    pub fn text(&self) -> String {
        let state = self.lock();
        let mut text = state.lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }

    /// Lines from `from` onwards, and whether the log is finished
    fn lines_from(&self, from: usize) -> (Vec<String>, bool) {
        let state = self.lock();
        let missed = state.lines.get(from..).map(<[String]>::to_vec).unwrap_or_default();
        (missed, state.finished)
    }

    pub fn subscribe(self: &Arc<Self>) -> LogSubscription {
        let state = self.lock();
        let live = (!state.finished).then(|| Live {
            log: self.clone(),
            receiver: self.tx.subscribe(),
            next: state.lines.len(),
            backlog: VecDeque::new(),
            finished: false,
        });
        LogSubscription {
            history: state.lines.clone(),
            live,
        }
    }
}

impl Default for BuildLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Live half of a subscription
struct Live {
    log: Arc<BuildLog>,
    receiver: broadcast::Receiver<LogEvent>,

    /// Index of the next line to hand out
    next: usize,

    /// Missed lines re-read after falling behind
    backlog: VecDeque<String>,

    /// The log finished while catching up
    finished: bool,
}

impl Live {
    fn catch_up(&mut self) {
        let (missed, finished) = self.log.lines_from(self.next + self.backlog.len());
        debug!("Build log subscriber caught up on {} line(s)", missed.len());
        self.backlog.extend(missed);
        self.finished = finished;
    }

    async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.backlog.pop_front() {
                self.next += 1;
                return Some(line);
            }
            if self.finished {
                return None;
            }
            match self.receiver.recv().await {
                Ok(LogEvent::Line(index, _)) if index < self.next => {}
                Ok(LogEvent::Line(index, line)) if index == self.next => {
                    self.next += 1;
                    return Some(line);
                }
                Ok(LogEvent::Line(..)) => self.catch_up(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Build log subscriber lagged by {} lines", skipped);
                    self.catch_up();
                }
                Ok(LogEvent::End) | Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// History plus live tail of a build log. Dropping it unsubscribes.
pub struct LogSubscription {
    pub history: Vec<String>,

    /// `None` when the log was already finished at subscribe time
    live: Option<Live>,
}

impl LogSubscription {
    /// Subscription over persisted text of a finished deployment
    pub fn finished(text: &str) -> Self {
        Self {
            history: text.lines().map(str::to_string).collect(),
            live: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Next live line, `None` at end of stream
    pub async fn next_line(&mut self) -> Option<String> {
        let line = self.live.as_mut()?.next_line().await;
        if line.is_none() {
            self.live = None;
        }
        line
    }

    /// History followed by live lines until the log finishes
    pub fn into_stream(self) -> BoxStream<'static, String> {
        let LogSubscription { history, live } = self;
        let live = LogSubscription {
            history: Vec::new(),
            live,
        };
        stream::iter(history)
            .chain(stream::unfold(live, |mut sub| async move {
                sub.next_line().await.map(|line| (line, sub))
            }))
            .boxed()
    }
}

/// Build logs of in-flight deployments
#[derive(Default)]
pub struct LogHub {
    logs: Mutex<HashMap<String, Arc<BuildLog>>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<BuildLog>>> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get or create the log of a deployment
    pub fn open(&self, deployment_id: &str) -> Arc<BuildLog> {
        self.lock()
            .entry(deployment_id.to_string())
            .or_insert_with(|| Arc::new(BuildLog::new()))
            .clone()
    }

    pub fn get(&self, deployment_id: &str) -> Option<Arc<BuildLog>> {
        self.lock().get(deployment_id).cloned()
    }

    /// Finish and forget a deployment's log; later readers use the persisted text
    pub fn close(&self, deployment_id: &str) {
        if let Some(log) = self.lock().remove(deployment_id) {
            log.finish();
            debug!("Closed build log for {}", deployment_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_late_subscriber_gets_history_then_live() {
        let log = Arc::new(BuildLog::new());
        log.append("step 1");
        log.append("step 2");

        let mut sub = log.subscribe();
        assert_eq!(sub.history, vec!["step 1", "step 2"]);

        log.append("step 3");
        assert_eq!(sub.next_line().await.as_deref(), Some("step 3"));

        log.finish();
        assert_eq!(sub.next_line().await, None);
    }

    #[tokio::test]
    async fn test_capture_without_subscribers() {
        let log = Arc::new(BuildLog::new());
        log.append("nobody listening");
        log.finish();
        log.append("ignored after finish");

        assert_eq!(log.text(), "nobody listening\n");
        let sub = log.subscribe();
        assert!(!sub.is_live());
        assert_eq!(sub.history, vec!["nobody listening"]);
    }

    #[tokio::test]
    async fn test_independent_subscribers() {
        let log = Arc::new(BuildLog::new());
        let first = log.subscribe();
        let mut second = log.subscribe();

        drop(first);
        log.append("still delivered");
        assert_eq!(second.next_line().await.as_deref(), Some("still delivered"));
    }

    #[tokio::test]
    async fn test_into_stream() {
        let log = Arc::new(BuildLog::new());
        log.append("a");
        let stream = log.subscribe().into_stream();
        log.append("b");
        log.finish();

        let lines: Vec<String> = stream.collect().await;
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_misses_nothing() {
        let log = Arc::new(BuildLog::new());
        log.append("before");
        let sub = log.subscribe();

        let total = CHANNEL_CAPACITY * 2 + 10;
        for i in 0..total {
            log.append(format!("line {}", i));
        }
        log.finish();

        let lines: Vec<String> = sub.into_stream().collect().await;
        assert_eq!(lines.len(), total + 1);
        assert_eq!(lines[0], "before");
        assert_eq!(lines[1], "line 0");
        assert_eq!(lines[total], format!("line {}", total - 1));
        assert!(lines[1..]
            .iter()
            .enumerate()
            .all(|(i, line)| *line == format!("line {}", i)));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_resumes_live() {
        let log = Arc::new(BuildLog::new());
        let mut sub = log.subscribe();
        for i in 0..CHANNEL_CAPACITY + 5 {
            log.append(format!("burst {}", i));
        }

        for i in 0..CHANNEL_CAPACITY + 5 {
            assert_eq!(sub.next_line().await, Some(format!("burst {}", i)));
        }

        log.append("after burst");
        assert_eq!(sub.next_line().await.as_deref(), Some("after burst"));
        log.finish();
        assert_eq!(sub.next_line().await, None);
        assert!(!sub.is_live());
    }

    #[test]
    fn test_hub_close_forgets_log() {
        let hub = LogHub::new();
        let log = hub.open("dep1");
        assert!(Arc::ptr_eq(&log, &hub.open("dep1")));

        hub.close("dep1");
        assert!(log.is_finished());
        assert!(hub.get("dep1").is_none());
    }
}
