//! Transfer progress for cache and artifact transfers
//!
//! A [`TransferMeter`] wraps a reader or writer and counts the bytes that
//! pass through it. With a non-zero frequency a reporter thread prints a
//! one-line progress update on every tick, then a final line once the
//! meter is finished or dropped.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Sender};

use crate::retry::parse_duration;

const PREFIXES: &[u8] = b"KMGTPE";

/// `--transfer-meter-frequency`, shared by the transferring commands.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct TransferMeterArgs {
    /// If set to more than 0s it enables an interactive transfer meter
    #[arg(
        long = "transfer-meter-frequency",
        env = "TRANSFER_METER_FREQUENCY",
        default_value = "0",
        value_parser = parse_duration
    )]
    pub transfer_meter_frequency: Duration,
}

impl TransferMeterArgs {
    /// Wrap `inner` in a meter printing to stdout under `label`.
    pub fn meter<T>(&self, inner: T, label: &str, total: Option<u64>) -> TransferMeter<T> {
        let format = LabelledRate::new(Box::new(io::stdout()), label, total);
        TransferMeter::new(inner, self.transfer_meter_frequency, format)
    }
}

/// Scale `b` to the largest SI unit below it.
fn scale(b: u64) -> (f64, Option<char>) {
    const UNIT: u64 = 1000;
    if b < UNIT {
        return (b as f64, None);
    }
    let (mut div, mut exp) = (UNIT, 0usize);
    let mut n = b / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    (b as f64 / div as f64, Some(PREFIXES[exp] as char))
}

/// `1 B`, `1.10 KB`, `1.11 MB`, ...
pub fn format_bytes(b: u64) -> String {
    match scale(b) {
        (size, None) => format!("{} B", size as u64),
        (size, Some(prefix)) => format!("{size:.2} {prefix}B"),
    }
}

/// Average rate of `b` bytes over `elapsed`. A zero duration counts as one
/// nanosecond.
pub fn format_byte_rate(b: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64().max(1e-9);
    match scale((b as f64 / secs) as u64) {
        (rate, None) => format!("{} B/s", rate as u64),
        (rate, Some(prefix)) => format!("{rate:.1} {prefix}B/s"),
    }
}

/// Progress line writer: `label written[/total] (rate)`.
pub struct LabelledRate {
    out: Box<dyn Write + Send>,
    label: String,
    total: Option<u64>,
}

impl LabelledRate {
    pub fn new(out: Box<dyn Write + Send>, label: &str, total: Option<u64>) -> Self {
        Self {
            out,
            label: label.to_string(),
            total,
        }
    }

    /// One progress line. It starts with `\r` so updates overwrite each
    /// other; the final line ends with a newline.
    pub fn line(&self, written: u64, elapsed: Duration, done: bool) -> String {
        let total = self
            .total
            .map(|t| format!("/{}", format_bytes(t)))
            .unwrap_or_default();
        let mut line = format!(
            "\r{} {}{} ({})                ",
            self.label,
            format_bytes(written),
            total,
            format_byte_rate(written, elapsed)
        );
        if done {
            line.push('\n');
        }
        line
    }

    fn report(&mut self, written: u64, elapsed: Duration, done: bool) {
        let line = self.line(written, elapsed, done);
        // progress output is best effort
        let _ = self.out.write_all(line.as_bytes());
        let _ = self.out.flush();
    }
}

/// Byte-counting wrapper around a reader or writer.
pub struct TransferMeter<T> {
    inner: T,
    count: Arc<AtomicU64>,
    done: Option<Sender<()>>,
    reporter: Option<JoinHandle<()>>,
}

impl<T> TransferMeter<T> {
    /// A zero `frequency` counts bytes without reporting.
    pub fn new(inner: T, frequency: Duration, mut format: LabelledRate) -> Self {
        let count = Arc::new(AtomicU64::new(0));
        if frequency.is_zero() {
            return Self {
                inner,
                count,
                done: None,
                reporter: None,
            };
        }

        let (done_tx, done_rx) = bounded::<()>(0);
        let counter = count.clone();
        let reporter = thread::spawn(move || {
            let started = Instant::now();
            let ticker = tick(frequency);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        format.report(counter.load(Ordering::Relaxed), started.elapsed(), false);
                    }
                    recv(done_rx) -> _ => {
                        format.report(counter.load(Ordering::Relaxed), started.elapsed(), true);
                        break;
                    }
                }
            }
        });

        Self {
            inner,
            count,
            done: Some(done_tx),
            reporter: Some(reporter),
        }
    }

    /// Bytes transferred so far.
    pub fn transferred(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Print the final line and stop the reporter.
    pub fn finish(&mut self) {
        // dropping the sender wakes the reporter for its last line
        drop(self.done.take());
        if let Some(reporter) = self.reporter.take() {
            let _ = reporter.join();
        }
    }

    fn add(&self, n: usize) {
        self.count.fetch_add(n as u64, Ordering::Relaxed);
    }
}

impl<T> Drop for TransferMeter<T> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<T: Read> Read for TransferMeter<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.add(n);
        Ok(n)
    }
}

impl<T: Write> Write for TransferMeter<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.add(n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_format_bytes() {
        let cases = [
            (1, "1 B"),
            (1100, "1.10 KB"),
            (1_110_000, "1.11 MB"),
            (1_111_000_000, "1.11 GB"),
            (1_111_100_000_000, "1.11 TB"),
            (1_111_110_000_000_000, "1.11 PB"),
            (1_111_110_000_000_000_000, "1.11 EB"),
        ];
        for (size, expected) in cases {
            assert_eq!(format_bytes(size), expected, "{size}");
        }
    }

    #[test]
    fn test_format_byte_rate() {
        let second = Duration::from_secs(1);
        let cases = [
            (1, second, "1 B/s"),
            (1000, second, "1.0 KB/s"),
            (1_000_000_000, second, "1.0 GB/s"),
            (1_000_000_000_000_000_000, second, "1.0 EB/s"),
            (1490, second, "1.5 KB/s"),
            (1510, second, "1.5 KB/s"),
            (1_300_000, second, "1.3 MB/s"),
            (1_490_000_000_000_000, second, "1.5 PB/s"),
            (10, Duration::from_secs(2), "5 B/s"),
            (10, Duration::ZERO, "10.0 GB/s"),
        ];
        for (size, elapsed, expected) in cases {
            assert_eq!(format_byte_rate(size, elapsed), expected, "{size} over {elapsed:?}");
        }
    }

    #[test]
    fn test_labelled_line() {
        let unknown = LabelledRate::new(Box::new(io::sink()), "Testing formatter", None);
        let line = unknown.line(10, Duration::from_secs(1), false);
        assert!(line.starts_with("\rTesting formatter 10 B (10 B/s)"));
        assert!(!line.ends_with('\n'));

        let known = LabelledRate::new(Box::new(io::sink()), "Testing formatter", Some(10));
        let line = known.line(10, Duration::from_secs(1), true);
        assert!(line.starts_with("\rTesting formatter 10 B/10 B (10 B/s)"));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_meter_counts_without_reporting() {
        let out = Shared::default();
        let format = LabelledRate::new(Box::new(out.clone()), "Uploading cache", Some(5));
        let mut meter = TransferMeter::new(&b"hello"[..], Duration::ZERO, format);
        let mut buf = Vec::new();
        meter.read_to_end(&mut buf).unwrap();
        assert_eq!(meter.transferred(), 5);
        drop(meter);
        assert!(out.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_meter_reports_final_line() {
        let out = Shared::default();
        let format = LabelledRate::new(Box::new(out.clone()), "Downloading cache", None);
        let mut meter = TransferMeter::new(Vec::new(), Duration::from_secs(3600), format);
        meter.write_all(b"0123456789").unwrap();
        meter.finish();

        let printed = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert!(printed.starts_with("\rDownloading cache 10 B ("), "{printed:?}");
        assert!(printed.ends_with('\n'));
        assert_eq!(meter.inner, b"0123456789");
    }
}
