//! Streaming output scrubber.
//!
//! A `Scrubber` wraps an underlying sink and redacts secret bytes inline,
//! including matches that straddle chunk boundaries and common encodings
//! of a secret. The write contract: `write(buf)` reports `buf.len()` and
//! never emits any prefix of a registered secret. A carry window of
//! `max(longest_pattern - 1, 3)` bytes is held back on every write; the
//! 3-byte floor protects partial UTF-8 code points.
//!
//! Frames buffer a scope of output so secrets discovered mid-scope can be
//! registered before anything is emitted. `lockdown_streams` swaps the
//! process stdout/stderr for pipes drained through the scrubber.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::FromRawFd;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use tracing::debug;
use zeroize::Zeroize;

use crate::vault::types::{hex_lower, hex_upper};

/// Source of secret patterns for the scrubber. The sole operation
/// returns the longest registered pattern occurring anywhere in the
/// chunk, with its placeholder.
pub trait SecretProvider: Send + Sync {
    fn find_secret(&self, chunk: &[u8]) -> Option<(Vec<u8>, String)>;

    /// Longest pattern length; sizes the carry window.
    fn max_pattern_len(&self) -> usize;
}

/// A list of (pattern, placeholder) pairs kept sorted longest-first so
/// the longest match wins. Ties keep registration order.
#[derive(Debug, Clone, Default)]
pub struct SecretSet {
    patterns: Vec<(Vec<u8>, String)>,
}

impl SecretSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Register one exact pattern.
    pub fn insert(&mut self, secret: &[u8], placeholder: &str) {
        if secret.is_empty() {
            return;
        }
        if self.patterns.iter().any(|(p, _)| p == secret) {
            return;
        }
        // Stable insert before the first strictly-shorter entry
        let at = self
            .patterns
            .iter()
            .position(|(p, _)| p.len() < secret.len())
            .unwrap_or(self.patterns.len());
        self.patterns.insert(at, (secret.to_vec(), placeholder.to_string()));
    }

    /// Register a secret together with its common encodings: hex in both
    /// cases, standard and URL-safe base64 with and without padding,
    /// percent-encoding, and separator-spread spellings. Every variant
    /// maps to the same placeholder.
    pub fn insert_with_variants(&mut self, secret: &[u8], placeholder: &str) {
        self.insert(secret, placeholder);
        self.insert(hex_lower(secret).as_bytes(), placeholder);
        self.insert(hex_upper(secret).as_bytes(), placeholder);
        self.insert(STANDARD.encode(secret).as_bytes(), placeholder);
        self.insert(STANDARD_NO_PAD.encode(secret).as_bytes(), placeholder);
        self.insert(URL_SAFE.encode(secret).as_bytes(), placeholder);
        self.insert(URL_SAFE_NO_PAD.encode(secret).as_bytes(), placeholder);
        let percent = percent_encode(secret);
        if percent.as_bytes() != secret {
            self.insert(percent.as_bytes(), placeholder);
        }
        if secret.len() >= 2 {
            for sep in [b'-', b'_', b':', b'.', b' '] {
                self.insert(&spread(secret, sep), placeholder);
            }
        }
    }
}

impl SecretProvider for SecretSet {
    fn find_secret(&self, chunk: &[u8]) -> Option<(Vec<u8>, String)> {
        // Sorted longest-first: the first hit is the longest match
        for (pattern, placeholder) in &self.patterns {
            if find_subslice(chunk, pattern).is_some() {
                return Some((pattern.clone(), placeholder.clone()));
            }
        }
        None
    }

    fn max_pattern_len(&self) -> usize {
        self.patterns.first().map(|(p, _)| p.len()).unwrap_or(0)
    }
}

fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn spread(bytes: &[u8], sep: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for (i, &b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(sep);
        }
        out.push(b);
    }
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

const MIN_CARRY: usize = 3;

struct Frame {
    label: String,
    buf: Vec<u8>,
}

struct ScrubState<W: Write> {
    sink: W,
    carry: Vec<u8>,
    frames: Vec<Frame>,
    /// Secrets registered by frames; inherited by everything scrubbed
    /// afterwards.
    extra: SecretSet,
    closed: bool,
}

/// Streaming writer that redacts registered secrets. Internally
/// synchronized: concurrent writers are serialized and bytes appear at
/// the sink in write order.
pub struct Scrubber<W: Write> {
    provider: Option<Arc<dyn SecretProvider>>,
    state: Mutex<ScrubState<W>>,
}

impl<W: Write> Scrubber<W> {
    /// Provider-less scrubber: passes bytes through untouched.
    pub fn passthrough(sink: W) -> Self {
        Self {
            provider: None,
            state: Mutex::new(ScrubState {
                sink,
                carry: Vec::new(),
                frames: Vec::new(),
                extra: SecretSet::new(),
                closed: false,
            }),
        }
    }

    pub fn new(sink: W, provider: Arc<dyn SecretProvider>) -> Self {
        Self {
            provider: Some(provider),
            state: Mutex::new(ScrubState {
                sink,
                carry: Vec::new(),
                frames: Vec::new(),
                extra: SecretSet::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScrubState<W>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Longest pattern across the base provider and frame-registered
    /// secrets.
    fn max_len(&self, state: &ScrubState<W>) -> usize {
        let base = self.provider.as_ref().map_or(0, |p| p.max_pattern_len());
        base.max(state.extra.max_pattern_len())
    }

    fn find(&self, extra: &SecretSet, chunk: &[u8]) -> Option<(Vec<u8>, String)> {
        let from_base = self.provider.as_ref().and_then(|p| p.find_secret(chunk));
        let from_extra = extra.find_secret(chunk);
        match (from_base, from_extra) {
            (None, e) => e,
            (b, None) => b,
            (Some(b), Some(e)) => {
                if b.0.len() >= e.0.len() {
                    Some(b)
                } else {
                    Some(e)
                }
            }
        }
    }

    /// Replace every registered secret in `data`, longest match first.
    fn scrub_all(&self, extra: &SecretSet, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        self.scrub_into(extra, data, &mut out);
        out
    }

    fn scrub_into(&self, extra: &SecretSet, data: &[u8], out: &mut Vec<u8>) {
        let mut rest = data;
        loop {
            let Some((pattern, placeholder)) = self.find(extra, rest) else {
                out.extend_from_slice(rest);
                return;
            };
            let Some(pos) = find_subslice(rest, &pattern) else {
                out.extend_from_slice(rest);
                return;
            };
            // The prefix may still hold shorter secrets
            self.scrub_into(extra, &rest[..pos], out);
            out.extend_from_slice(placeholder.as_bytes());
            rest = &rest[pos + pattern.len()..];
        }
    }

    /// Write through the scrubber. Always reports the full input length;
    /// redacted output may be shorter or longer.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scrubber closed"));
        }

        if let Some(frame) = state.frames.last_mut() {
            frame.buf.extend_from_slice(buf);
            return Ok(buf.len());
        }

        let max_len = self.max_len(&state);
        if max_len == 0 {
            state.sink.write_all(buf)?;
            return Ok(buf.len());
        }

        state.carry.extend_from_slice(buf);
        let scrubbed = self.scrub_all(&state.extra, &state.carry);
        let window = max_len.saturating_sub(1).max(MIN_CARRY);
        if scrubbed.len() > window {
            let safe = scrubbed.len() - window;
            state.sink.write_all(&scrubbed[..safe])?;
            state.carry.zeroize();
            state.carry = scrubbed[safe..].to_vec();
        } else {
            state.carry.zeroize();
            state.carry = scrubbed;
        }
        Ok(buf.len())
    }

    /// Scan and emit the remaining carry, then flush the sink.
    pub fn flush(&self) -> io::Result<()> {
        let mut state = self.lock();
        self.flush_carry(&mut state)?;
        state.sink.flush()
    }

    fn flush_carry(&self, state: &mut ScrubState<W>) -> io::Result<()> {
        if state.carry.is_empty() {
            return Ok(());
        }
        let scrubbed = self.scrub_all(&state.extra, &state.carry);
        state.sink.write_all(&scrubbed)?;
        state.carry.zeroize();
        state.carry.clear();
        Ok(())
    }

    /// Flush, then zeroize the carry and any frame buffers. Further
    /// writes fail.
    pub fn close(&self) -> io::Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        let result = self.flush_carry(&mut state).and_then(|_| state.sink.flush());
        state.carry.zeroize();
        state.carry.clear();
        for frame in &mut state.frames {
            frame.buf.zeroize();
            frame.buf.clear();
        }
        state.frames.clear();
        state.closed = true;
        result
    }

    /// Open a buffering scope; writes accumulate until `end_frame`.
    pub fn start_frame(&self, label: &str) {
        let mut state = self.lock();
        debug!(label, "scrubber frame opened");
        state.frames.push(Frame {
            label: label.to_string(),
            buf: Vec::new(),
        });
    }

    /// Register the frame's secrets, rescrub the buffered bytes, and
    /// release them to the enclosing frame or the stream. Registered
    /// secrets persist: inner frames and later writes inherit them.
    pub fn end_frame(&self, additional_secrets: &[(Vec<u8>, String)]) -> io::Result<()> {
        let mut state = self.lock();
        let Some(mut frame) = state.frames.pop() else {
            return Ok(());
        };
        debug!(label = %frame.label, "scrubber frame closed");
        for (secret, placeholder) in additional_secrets {
            state.extra.insert(secret, placeholder);
        }
        let scrubbed = self.scrub_all(&state.extra, &frame.buf);
        frame.buf.zeroize();

        if let Some(parent) = state.frames.last_mut() {
            parent.buf.extend_from_slice(&scrubbed);
            return Ok(());
        }

        // Route through the carry so a secret straddling the frame edge
        // and the following stream bytes is still caught.
        let max_len = self.max_len(&state);
        if max_len == 0 {
            state.sink.write_all(&scrubbed)?;
            return Ok(());
        }
        state.carry.extend_from_slice(&scrubbed);
        let rescrubbed = self.scrub_all(&state.extra, &state.carry);
        let window = max_len.saturating_sub(1).max(MIN_CARRY);
        if rescrubbed.len() > window {
            let safe = rescrubbed.len() - window;
            state.sink.write_all(&rescrubbed[..safe])?;
            state.carry.zeroize();
            state.carry = rescrubbed[safe..].to_vec();
        } else {
            state.carry.zeroize();
            state.carry = rescrubbed;
        }
        Ok(())
    }

    /// Consume the scrubber and return the sink. Unflushed carry is
    /// discarded; call `close` first.
    pub fn into_inner(self) -> W {
        self.state
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .sink
    }
}

impl<W: Write> Write for &Scrubber<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Scrubber::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Scrubber::flush(self)
    }
}

// =============================================================================
// Stream lockdown
// =============================================================================

/// Handle returned by `lockdown_streams`. `restore` puts the original
/// stdout/stderr back, joins the copy threads, and flushes the scrubber.
/// Idempotent; also runs on drop.
pub struct LockdownGuard {
    saved_stdout: i32,
    saved_stderr: i32,
    readers: Vec<JoinHandle<()>>,
    flush: Box<dyn Fn() -> io::Result<()> + Send>,
    restored: bool,
}

impl LockdownGuard {
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        unsafe {
            // Re-installing the saved fds drops the last write ends of
            // the pipes; the readers see EOF and exit.
            libc::dup2(self.saved_stdout, 1);
            libc::dup2(self.saved_stderr, 2);
            libc::close(self.saved_stdout);
            libc::close(self.saved_stderr);
        }
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        let _ = (self.flush)();
    }
}

impl Drop for LockdownGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Swap the process stdout and stderr for pipes drained through the
/// scrubber by two background copy threads.
///
/// Panics when the pipe or dup plumbing fails; there is no sensible
/// recovery while the process streams are half-swapped.
pub fn lockdown_streams<W: Write + Send + 'static>(scrubber: Arc<Scrubber<W>>) -> LockdownGuard {
    unsafe {
        let saved_stdout = libc::dup(1);
        let saved_stderr = libc::dup(2);
        if saved_stdout < 0 || saved_stderr < 0 {
            panic!("lockdown_streams: dup failed: {}", io::Error::last_os_error());
        }

        let mut readers = Vec::with_capacity(2);
        for target_fd in [1, 2] {
            let mut fds = [0i32; 2];
            if libc::pipe(fds.as_mut_ptr()) != 0 {
                panic!("lockdown_streams: pipe failed: {}", io::Error::last_os_error());
            }
            let (read_fd, write_fd) = (fds[0], fds[1]);
            if libc::dup2(write_fd, target_fd) < 0 {
                panic!("lockdown_streams: dup2 failed: {}", io::Error::last_os_error());
            }
            // The target fd now holds the only write end we keep
            libc::close(write_fd);

            let scrubber = Arc::clone(&scrubber);
            let mut pipe = File::from_raw_fd(read_fd);
            readers.push(std::thread::spawn(move || {
                let mut buf = [0u8; 8192];
                loop {
                    match pipe.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if scrubber.write(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        debug!("stdout/stderr locked down through scrubber");
        let flush_scrubber = Arc::clone(&scrubber);
        LockdownGuard {
            saved_stdout,
            saved_stderr,
            readers,
            flush: Box::new(move || flush_scrubber.flush()),
            restored: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }

        fn string(&self) -> String {
            String::from_utf8(self.contents()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn secret_set(pairs: &[(&str, &str)]) -> Arc<SecretSet> {
        let mut set = SecretSet::new();
        for (secret, placeholder) in pairs {
            set.insert(secret.as_bytes(), placeholder);
        }
        Arc::new(set)
    }

    #[test]
    fn test_passthrough() {
        let sink = SharedBuf::default();
        let scrubber = Scrubber::passthrough(sink.clone());
        scrubber.write(b"hello world").unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "hello world");
    }

    #[test]
    fn test_basic_redaction() {
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(sink.clone(), secret_set(&[("tok", "<R>")]));
        scrubber.write(b"key=tok done\n").unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "key=<R> done\n");
    }

    #[test]
    fn test_embedded_occurrence_also_redacted() {
        // The write contract forbids emitting the secret bytes anywhere,
        // even inside a longer word.
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(sink.clone(), secret_set(&[("tok", "<R>")]));
        scrubber.write(b"token=tok done\n").unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "<R>en=<R> done\n");
    }

    #[test]
    fn test_chunk_boundary() {
        let sink = SharedBuf::default();
        let scrubber =
            Scrubber::new(sink.clone(), secret_set(&[("SECRET_TOKEN", "<PLACEHOLDER>")]));
        scrubber.write(b"prefix SECRET_").unwrap();
        scrubber.write(b"TOKEN suffix").unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "prefix <PLACEHOLDER> suffix");
    }

    #[test]
    fn test_longest_match_wins() {
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(
            sink.clone(),
            secret_set(&[("SECRET", "<A>"), ("SECRET_EXTENDED", "<B>")]),
        );
        scrubber.write(b"SECRET_EXTENDED").unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "<B>");
    }

    #[test]
    fn test_idempotent() {
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(sink.clone(), secret_set(&[("hunter2", "<X>")]));
        scrubber.write(b"pass=hunter2!").unwrap();
        scrubber.flush().unwrap();
        let once = sink.string();

        let sink2 = SharedBuf::default();
        let scrubber2 = Scrubber::new(sink2.clone(), secret_set(&[("hunter2", "<X>")]));
        scrubber2.write(once.as_bytes()).unwrap();
        scrubber2.flush().unwrap();
        assert_eq!(sink2.string(), once);
    }

    #[test]
    fn test_no_prefix_ever_emitted() {
        let secret = b"SECRET_TOKEN";
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(sink.clone(), secret_set(&[("SECRET_TOKEN", "<R>")]));
        let input = b"noise SECRET_TOKEN more SECRET_TO";
        for chunk in input.chunks(1) {
            scrubber.write(chunk).unwrap();
            let written = sink.contents();
            for suffix_len in 1..secret.len() {
                if written.len() >= suffix_len {
                    let tail = &written[written.len() - suffix_len..];
                    assert_ne!(
                        tail,
                        &secret[..suffix_len],
                        "emitted a strict prefix of the secret"
                    );
                }
            }
        }
    }

    #[test]
    fn test_multiple_occurrences() {
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(sink.clone(), secret_set(&[("abc123", "<S>")]));
        scrubber.write(b"abc123 mid abc123 end").unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "<S> mid <S> end");
    }

    #[test]
    fn test_shorter_secret_before_longer_position() {
        // The longest match sits later in the buffer; the earlier,
        // shorter secret must still be caught in the prefix.
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(
            sink.clone(),
            secret_set(&[("SECRET", "<A>"), ("SECRET_EXTENDED", "<B>")]),
        );
        scrubber.write(b"SECRET then SECRET_EXTENDED").unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "<A> then <B>");
    }

    #[test]
    fn test_concurrent_writers() {
        let sink = SharedBuf::default();
        let scrubber = Arc::new(Scrubber::new(sink.clone(), secret_set(&[("secret", "<R>")])));
        let mut handles = Vec::new();
        for i in 0..8 {
            let scrubber = Arc::clone(&scrubber);
            handles.push(std::thread::spawn(move || {
                scrubber
                    .write(format!("thread {}: secret\n", i).as_bytes())
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        scrubber.flush().unwrap();
        let out = sink.string();
        assert!(!out.contains("secret"));
        assert_eq!(out.matches("<R>").count(), 8);
    }

    #[test]
    fn test_frame_redacts_with_late_secrets() {
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(sink.clone(), secret_set(&[("base", "<B>")]));
        scrubber.start_frame("resolve");
        scrubber.write(b"value=abc123 base\n").unwrap();
        scrubber
            .end_frame(&[(b"abc123".to_vec(), "<F>".to_string())])
            .unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "value=<F> <B>\n");
    }

    #[test]
    fn test_frame_secrets_persist_after_frame() {
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(sink.clone(), secret_set(&[("base", "<B>")]));
        scrubber.start_frame("resolve");
        scrubber.write(b"x").unwrap();
        scrubber
            .end_frame(&[(b"abc123".to_vec(), "<F>".to_string())])
            .unwrap();
        scrubber.write(b" later abc123\n").unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "x later <F>\n");
    }

    #[test]
    fn test_nested_frames_inherit() {
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(sink.clone(), secret_set(&[("base", "<B>")]));
        scrubber.start_frame("outer");
        scrubber.write(b"o1 ").unwrap();
        scrubber.start_frame("inner");
        scrubber.write(b"inner sees outer-secret and base").unwrap();
        scrubber
            .end_frame(&[(b"outer-secret".to_vec(), "<O>".to_string())])
            .unwrap();
        scrubber.write(b" o2 outer-secret").unwrap();
        scrubber.end_frame(&[]).unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "o1 inner sees <O> and <B> o2 <O>");
    }

    #[test]
    fn test_variant_redaction() {
        let sink = SharedBuf::default();
        let mut set = SecretSet::new();
        set.insert_with_variants(b"topsecret", "<V>");
        let scrubber = Scrubber::new(sink.clone(), Arc::new(set));
        let hex = hex_lower(b"topsecret");
        let b64 = STANDARD.encode(b"topsecret");
        let spread = "t-o-p-s-e-c-r-e-t";
        let line = format!("raw=topsecret hex={} b64={} spread={}\n", hex, b64, spread);
        scrubber.write(line.as_bytes()).unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "raw=<V> hex=<V> b64=<V> spread=<V>\n");
    }

    #[test]
    fn test_percent_encoding_variant() {
        let sink = SharedBuf::default();
        let mut set = SecretSet::new();
        set.insert_with_variants(b"p@ss w0rd", "<P>");
        let scrubber = Scrubber::new(sink.clone(), Arc::new(set));
        scrubber.write(b"url?k=p%40ss%20w0rd end").unwrap();
        scrubber.flush().unwrap();
        assert_eq!(sink.string(), "url?k=<P> end");
    }

    #[test]
    fn test_close_rejects_further_writes() {
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(sink.clone(), secret_set(&[("tok", "<R>")]));
        scrubber.write(b"a tok b").unwrap();
        scrubber.close().unwrap();
        assert_eq!(sink.string(), "a <R> b");
        assert!(scrubber.write(b"more").is_err());
        // close is idempotent
        scrubber.close().unwrap();
    }

    #[test]
    fn test_write_reports_full_length() {
        let scrubber = Scrubber::new(SharedBuf::default(), secret_set(&[("tok", "<R>")]));
        assert_eq!(scrubber.write(b"token=tok").unwrap(), 9);
    }

    #[test]
    fn test_write_trait_on_shared_ref() {
        let sink = SharedBuf::default();
        let scrubber = Scrubber::new(sink.clone(), secret_set(&[("tok", "<R>")]));
        let mut writer = &scrubber;
        writer.write_all(b"tok!").unwrap();
        writer.flush().unwrap();
        assert_eq!(sink.string(), "<R>!");
    }

    #[test]
    #[ignore = "swaps the process stdout/stderr; run single-threaded"]
    fn test_lockdown_streams_roundtrip() {
        let sink = SharedBuf::default();
        let scrubber = Arc::new(Scrubber::new(sink.clone(), secret_set(&[("sekrit", "<R>")])));
        let mut guard = lockdown_streams(Arc::clone(&scrubber));
        unsafe {
            let msg = b"raw sekrit bytes\n";
            libc::write(1, msg.as_ptr() as *const libc::c_void, msg.len());
        }
        guard.restore();
        // restore is idempotent
        guard.restore();
        let out = sink.string();
        assert!(out.contains("<R>"));
        assert!(!out.contains("sekrit"));
    }

    #[test]
    fn test_secret_set_ordering() {
        let mut set = SecretSet::new();
        set.insert(b"aa", "<1>");
        set.insert(b"cccc", "<2>");
        set.insert(b"bbb", "<3>");
        assert_eq!(set.max_pattern_len(), 4);
        let (pattern, _) = set.find_secret(b"xx aa bbb cccc").unwrap();
        assert_eq!(pattern, b"cccc");
    }
}
