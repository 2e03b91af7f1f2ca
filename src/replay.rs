/*! Offline bus log replay.

Feeds a captured text log through the deframer as if the bytes came in
off the bus. Log lines look like

```text
1692822413.120 3C 01 06 B8 40 03 00 00 FF FC tx ok
```

one frame per line: a timestamp, the frame bytes in hex (PID first,
checksum last), and trailing junk from the capture tool. Which columns
hold the bytes varies between tools, so the slice bounds are
parameters; the defaults take everything but the first and the last two
columns. Python-style negative indices count from the end.
 */
use std::io::BufRead;

use log::{debug, warn};

use crate::Result;
use crate::deframer::{Deframer, DeframerEvent};
use crate::frame::Frame;

/// Counters from one replay run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Non-empty lines seen.
    pub lines: u64,
    /// Lines that did not parse as hex bytes.
    pub bad_lines: u64,
    /// Frames that made it through the deframer.
    pub frames: u64,
}

fn resolve(i: isize, len: usize) -> usize {
    if i < 0 {
        len.saturating_sub(i.unsigned_abs())
    } else {
        (i as usize).min(len)
    }
}

/// Extract the frame bytes from one log line. `None` for empty lines
/// and lines whose selected columns are not hex bytes.
#[must_use]
pub fn parse_line(line: &str, first: isize, last: isize) -> Option<Vec<u8>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }
    let start = resolve(first, tokens.len());
    let end = resolve(last, tokens.len());
    if start >= end {
        debug!("line has no byte columns: {line:?}");
        return None;
    }
    tokens[start..end]
        .iter()
        .map(|t| u8::from_str_radix(t, 16).ok())
        .collect()
}

/// Replay a whole log through a deframer, calling `on_frame` for every
/// frame that validates. Returns counters; fails only on read errors.
pub fn feed_log<R: BufRead, F: FnMut(Frame)>(
    reader: R,
    first: isize,
    last: isize,
    deframer: &mut Deframer,
    mut on_frame: F,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;
        let Some(bytes) = parse_line(&line, first, last) else {
            warn!("skipping unparsable line: {line:?}");
            stats.bad_lines += 1;
            continue;
        };
        for ev in deframer.feed_frame(&bytes) {
            if let DeframerEvent::Frame(f) = ev {
                stats.frames += 1;
                on_frame(f);
            }
        }
    }
    Ok(stats)
}
