//! Incremental marker detection over the shell's stdout.

use uuid::Uuid;

/// The pair of sentinels framing one command execution.
#[derive(Debug, Clone)]
pub struct Markers {
    pub end: String,
    pub exit: String,
}

impl Markers {
    pub fn new(id: &Uuid) -> Self {
        let id = id.simple();
        Self {
            end: format!("__CMD_END_{}__", id),
            exit: format!("__CMD_EXIT_{}__", id),
        }
    }
}

/// What a scan over the buffered output turned up.
#[derive(Debug, PartialEq, Eq)]
pub enum Scan {
    /// No marker yet. `ready` is output that can no longer turn out to be
    /// part of the marker and has not been handed out before.
    Pending { ready: Vec<u8> },
    /// The marker line arrived. `before` is everything ahead of it; `ready` is
    /// the part of `before` not handed out by earlier scans.
    Found { before: Vec<u8>, ready: Vec<u8> },
}

/// Buffers raw chunks and looks for a complete `marker\n` line, however the
/// transport happens to split it.
///
/// Output already handed out as `ready` is dropped from the front once the
/// buffer grows past `limit`, and `before` never exceeds it either, so a
/// chatty command keeps only its tail.
#[derive(Debug)]
pub struct MarkerScanner {
    buf: Vec<u8>,
    /// Bytes of `buf` already returned as `ready`.
    emitted: usize,
    /// No match can start before this offset.
    scan_from: usize,
    limit: usize,
    dropped: usize,
}

impl Default for MarkerScanner {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl MarkerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            emitted: 0,
            scan_from: 0,
            limit,
            dropped: 0,
        }
    }

    /// Bytes discarded to stay under the limit since the last call.
    pub fn take_dropped(&mut self) -> usize {
        std::mem::take(&mut self.dropped)
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Look for `marker` followed by a newline. On a hit the buffer is
    /// consumed through the newline and whatever follows stays buffered.
    pub fn scan(&mut self, marker: &str) -> Scan {
        let mut pattern = Vec::with_capacity(marker.len() + 1);
        pattern.extend_from_slice(marker.as_bytes());
        pattern.push(b'\n');

        if let Some(pos) = find(&self.buf[self.scan_from..], &pattern).map(|p| p + self.scan_from) {
            let ready = self.buf[self.emitted.min(pos)..pos].to_vec();
            let mut start = pos.saturating_sub(self.limit);
            while start < pos && is_continuation(self.buf[start]) {
                start += 1;
            }
            self.dropped += start;
            let before = self.buf[start..pos].to_vec();
            self.buf.drain(..pos + pattern.len());
            self.emitted = 0;
            self.scan_from = 0;
            return Scan::Found { before, ready };
        }

        self.scan_from = self.buf.len().saturating_sub(pattern.len() - 1);

        let held = partial_suffix_len(&self.buf, &pattern);
        let safe = self.buf.len() - held;
        let ready = if safe > self.emitted {
            let candidate = &self.buf[self.emitted..safe];
            let complete = complete_utf8_len(candidate);
            let ready = candidate[..complete].to_vec();
            self.emitted += complete;
            ready
        } else {
            Vec::new()
        };
        self.enforce_limit();
        Scan::Pending { ready }
    }

    fn enforce_limit(&mut self) {
        if self.buf.len() <= self.limit {
            return;
        }
        let mut cut = (self.buf.len() - self.limit).min(self.emitted);
        // `emitted` always ends on a character boundary.
        while cut < self.emitted && is_continuation(self.buf[cut]) {
            cut += 1;
        }
        if cut == 0 {
            return;
        }
        self.buf.drain(..cut);
        self.emitted -= cut;
        self.scan_from = self.scan_from.saturating_sub(cut);
        self.dropped += cut;
    }

    /// Drain everything buffered, marker or not.
    pub fn take_all(&mut self) -> Vec<u8> {
        self.emitted = 0;
        self.scan_from = 0;
        std::mem::take(&mut self.buf)
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest proper prefix of `pattern` that `buf` ends with.
fn partial_suffix_len(buf: &[u8], pattern: &[u8]) -> usize {
    let max = buf.len().min(pattern.len() - 1);
    (1..=max)
        .rev()
        .find(|&k| buf.ends_with(&pattern[..k]))
        .unwrap_or(0)
}

/// Length of `bytes` without a trailing, still incomplete UTF-8 sequence.
pub fn complete_utf8_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let b = bytes[len - back];
        if is_continuation(b) {
            continue;
        }
        let width = match b {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}
