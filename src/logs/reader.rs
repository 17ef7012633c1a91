/// Line reader for one child output stream
use super::record::{LogRecord, StreamKind};
use crate::config::types::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, warn};
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Reads a stream line by line on its own thread until EOF, turning each non-blank line
/// into a [`LogRecord`] handed to `on_record`.
pub struct StreamReader {
    stream: StreamKind,
    handle: Option<JoinHandle<()>>,
    done_rx: Receiver<()>,
    last_line: Arc<Mutex<Option<String>>>,
    lines: Arc<AtomicU64>,
}

impl StreamReader {
    pub fn spawn<R, F>(stream: StreamKind, source: R, on_record: F) -> Result<Self>
    where
        R: Read + Send + 'static,
        F: Fn(LogRecord) + Send + 'static,
    {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let last_line = Arc::new(Mutex::new(None));
        let lines = Arc::new(AtomicU64::new(0));

        let thread_last = Arc::clone(&last_line);
        let thread_lines = Arc::clone(&lines);
        let handle = std::thread::Builder::new()
            .name(format!("scorebox-{}-reader", stream))
            .spawn(move || {
                read_lines(stream, source, &thread_last, &thread_lines, on_record);
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            stream,
            handle: Some(handle),
            done_rx,
            last_line,
            lines,
        })
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    /// Last non-blank line seen so far
    pub fn last_line(&self) -> Option<String> {
        self.last_line.lock().ok().and_then(|line| line.clone())
    }

    pub fn lines_read(&self) -> u64 {
        self.lines.load(Ordering::SeqCst)
    }

    /// Wait until the stream hits EOF. Safe to call repeatedly.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Reap the thread if it has finished; a reader still blocked on the pipe stays put
    pub fn join(&mut self, timeout: Duration) -> bool {
        if !self.wait(timeout) {
            return false;
        }
        match self.handle.take() {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }
}

fn read_lines<R, F>(
    stream: StreamKind,
    source: R,
    last_line: &Mutex<Option<String>>,
    lines: &AtomicU64,
    on_record: F,
) where
    R: Read,
    F: Fn(LogRecord),
{
    let mut reader = BufReader::new(source);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.strip_suffix('\n').unwrap_or(&text);
                let line = line.strip_suffix('\r').unwrap_or(line);
                if line.trim().is_empty() {
                    continue;
                }
                lines.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut last) = last_line.lock() {
                    *last = Some(line.to_string());
                }
                on_record(LogRecord::from_line(stream, line));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("{} reader stopped on read error: {}", stream, e);
                break;
            }
        }
    }
    debug!("{} reader reached EOF", stream);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(stream: StreamKind, input: &'static str) -> (StreamReader, Arc<Mutex<Vec<LogRecord>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reader = StreamReader::spawn(stream, Cursor::new(input.as_bytes()), move |r| {
            sink.lock().unwrap().push(r)
        })
        .unwrap();
        (reader, seen)
    }

    #[test]
    fn emits_one_record_per_non_blank_line() {
        let (mut reader, seen) = collect(StreamKind::Stdout, "one\n\n   \ntwo\r\nthree");
        assert!(reader.join(Duration::from_secs(2)));

        let messages: Vec<_> = seen.lock().unwrap().iter().map(|r| r.message.clone()).collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
        assert_eq!(reader.lines_read(), 3);
        assert_eq!(reader.last_line().as_deref(), Some("three"));
    }

    #[test]
    fn wait_is_repeatable_after_eof() {
        let (reader, _) = collect(StreamKind::Stderr, "x\n");
        assert!(reader.wait(Duration::from_secs(2)));
        assert!(reader.wait(Duration::from_millis(10)));
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let bytes: &'static [u8] = b"ok\n\xff\xfe bad\nafter\n";
        let mut reader = StreamReader::spawn(StreamKind::Stdout, Cursor::new(bytes), move |r| {
            sink.lock().unwrap().push(r)
        })
        .unwrap();
        assert!(reader.join(Duration::from_secs(2)));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }
}
