//! Utility functions for file handling and common operations

use crate::{EpqError, EpqResult};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Check if a file is gzip compressed
pub fn is_gzipped<P: AsRef<Path>>(path: P) -> EpqResult<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0; 2];

    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1f, 0x8b]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(EpqError::Io(e)),
    }
}

/// Open a text file for buffered reading, decompressing gzip transparently
pub fn open_maybe_gzipped<P: AsRef<Path>>(path: P) -> EpqResult<Box<dyn BufRead>> {
    let file = File::open(&path)
        .map_err(|_| EpqError::FileNotFound(path.as_ref().to_string_lossy().to_string()))?;

    let reader: Box<dyn BufRead> = if is_gzipped(&path)? {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(reader)
}

/// Buffered table writer, optionally gzip-compressed.
///
/// Call [`finish`](OutputWriter::finish) when done: it flushes the buffer and
/// writes the gzip trailer, reporting errors that dropping would lose.
pub enum OutputWriter<W: Write = File> {
    Plain(BufWriter<W>),
    Gzip(BufWriter<GzEncoder<W>>),
}

impl<W: Write> OutputWriter<W> {
    pub fn finish(self) -> EpqResult<()> {
        match self {
            OutputWriter::Plain(mut w) => w.flush()?,
            OutputWriter::Gzip(w) => {
                let encoder = w.into_inner().map_err(|e| e.into_error())?;
                encoder.finish()?;
            }
        }
        Ok(())
    }
}

impl<W: Write> Write for OutputWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            OutputWriter::Plain(w) => w.write(buf),
            OutputWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            OutputWriter::Plain(w) => w.flush(),
            OutputWriter::Gzip(w) => w.flush(),
        }
    }
}

/// Create an output file, gzip-compressed when the path ends in `.gz`
pub fn create_output<P: AsRef<Path>>(path: P) -> EpqResult<OutputWriter> {
    ensure_parent_dirs(&path)?;
    let file = File::create(&path)?;
    let writer = if has_extension(&path, "gz") {
        OutputWriter::Gzip(BufWriter::new(GzEncoder::new(file, Compression::default())))
    } else {
        OutputWriter::Plain(BufWriter::new(file))
    };
    Ok(writer)
}

/// Get the number of CPU cores, with a fallback default
pub fn get_num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Validate file paths and check if they exist
pub fn validate_file_exists<P: AsRef<Path>>(path: P) -> EpqResult<()> {
    if !path.as_ref().exists() {
        return Err(EpqError::FileNotFound(
            path.as_ref().to_string_lossy().to_string(),
        ));
    }
    Ok(())
}

/// Validate that a file is readable
pub fn validate_file_readable<P: AsRef<Path>>(path: P) -> EpqResult<()> {
    validate_file_exists(&path)?;

    File::open(&path)
        .map_err(|_| EpqError::FileNotFound(path.as_ref().to_string_lossy().to_string()))?;

    Ok(())
}

/// Check if a path has a specific extension
pub fn has_extension<P: AsRef<Path>>(path: P, extension: &str) -> bool {
    path.as_ref()
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Create parent directories if they don't exist
pub fn ensure_parent_dirs<P: AsRef<Path>>(path: P) -> EpqResult<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Log progress information
pub fn log_progress(current: usize, total: usize, message: &str) {
    if total > 0 {
        let percentage = (current as f64 / total as f64) * 100.0;
        log::info!("{}: {} / {} ({:.1}%)", message, current, total, percentage);
    }
}

/// Timer utility for measuring execution time
pub struct Timer {
    start: std::time::Instant,
    name: String,
}

impl Timer {
    pub fn new(name: &str) -> Self {
        log::info!("Starting: {}", name);
        Timer {
            start: std::time::Instant::now(),
            name: name.to_string(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn log_elapsed(&self) {
        log::info!("'{}' finished in {:.2?}", self.name, self.elapsed());
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.log_elapsed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_is_gzipped() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "test content").unwrap();
        assert!(!is_gzipped(temp_file.path()).unwrap());

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(&[0x1f, 0x8b]).unwrap();
        assert!(is_gzipped(temp_file.path()).unwrap());
    }

    #[test]
    fn test_gzip_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("table.tsv.gz");
        let mut out = create_output(&path).unwrap();
        writeln!(out, "a\tb").unwrap();
        writeln!(out, "1\t2").unwrap();
        out.finish().unwrap();
        assert!(is_gzipped(&path).unwrap());

        let lines: Vec<String> = open_maybe_gzipped(&path)
            .unwrap()
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines, vec!["a\tb", "1\t2"]);
    }

    /// Accepts `capacity` bytes, then fails every write
    struct LimitedSink {
        capacity: usize,
    }

    impl Write for LimitedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.capacity == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "sink full"));
            }
            let n = buf.len().min(self.capacity);
            self.capacity -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_finish_reports_gzip_write_errors() {
        let sink = LimitedSink { capacity: 4 };
        let mut out = OutputWriter::Gzip(BufWriter::new(GzEncoder::new(sink, Compression::default())));
        // Buffered, so the failure only surfaces when the stream is finished
        writeln!(out, "protein\tstatus\treason").unwrap();
        assert!(matches!(out.finish(), Err(EpqError::Io(_))));

        let sink = LimitedSink { capacity: 1 << 16 };
        let mut out = OutputWriter::Gzip(BufWriter::new(GzEncoder::new(sink, Compression::default())));
        writeln!(out, "protein\tstatus\treason").unwrap();
        assert!(out.finish().is_ok());

        let mut out = OutputWriter::Plain(BufWriter::new(LimitedSink { capacity: 0 }));
        writeln!(out, "x").unwrap();
        assert!(out.finish().is_err());
    }

    #[test]
    fn test_get_num_cpus() {
        assert!(get_num_cpus() >= 1);
    }

    #[test]
    fn test_validate_file_exists() {
        let temp_file = NamedTempFile::new().unwrap();
        assert!(validate_file_exists(temp_file.path()).is_ok());
        assert!(validate_file_readable(temp_file.path()).is_ok());
        assert!(matches!(
            validate_file_exists("/nonexistent/file"),
            Err(EpqError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_has_extension() {
        assert!(has_extension("proteins.tsv.gz", "gz"));
        assert!(has_extension("proteins.TSV", "tsv"));
        assert!(!has_extension("proteins.tsv", "gz"));
        assert!(!has_extension("proteins", "tsv"));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new("test");
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(timer.elapsed().as_millis() >= 1);
    }
}
