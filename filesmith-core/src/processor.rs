use crate::atomic::{temp_sibling, TempGuard};
use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Files at or under this size run in full mode when `Auto` is selected.
const AUTO_FULL_MAX: u64 = 10 * 1024 * 1024;
const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;
/// Line mode polls the cancellation token this often.
const CANCEL_POLL_LINES: u64 = 1000;
/// Per-unit errors kept verbatim in the result before truncation.
const UNIT_ERROR_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Auto,
    Full,
    Line,
    Chunk,
}

/// Configuration for one processing run.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    pub input_path: PathBuf,
    /// Defaults to `input_path` (in-place transformation).
    pub output_path: Option<PathBuf>,
    pub mode: ProcessingMode,
    pub chunk_size: Option<usize>,
    pub create_backup: bool,
    pub dry_run: bool,
}

impl ProcessingConfig {
    pub fn in_place(input_path: PathBuf) -> Self {
        Self {
            input_path,
            output_path: None,
            mode: ProcessingMode::Auto,
            chunk_size: None,
            create_backup: true,
            dry_run: false,
        }
    }
}

/// Context handed to the transformation function alongside each unit.
#[derive(Debug, Clone)]
pub struct UnitInfo<'a> {
    pub file: &'a Path,
    pub total_size: u64,
    /// 1-based, line mode only.
    pub line_number: Option<u64>,
    /// 0-based, chunk mode only.
    pub chunk_index: Option<usize>,
    pub total_chunks: Option<usize>,
}

/// Transformation callback. Receives one unit (the whole content, a line
/// without its terminator, or a raw chunk) and returns the replacement
/// bytes. An error is recorded and the original unit passes through.
pub type ProcessFn<'a> = &'a mut dyn FnMut(&[u8], &UnitInfo<'_>) -> Result<Vec<u8>, String>;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub mode_used: ProcessingMode,
    pub units_processed: u64,
    pub units_failed: u64,
    /// First few per-unit errors, verbatim.
    pub unit_errors: Vec<String>,
    pub transformed: bool,
    pub bytes_written: u64,
    pub backup_id: Option<String>,
    pub dry_run: bool,
}

/// Run a transformation over a file in one of three modes, writing the
/// result through a sibling temp file and an atomic rename.
pub fn process(
    engine: &Engine,
    config: &ProcessingConfig,
    cancel: &CancellationToken,
    process_fn: ProcessFn<'_>,
) -> EngineResult<ProcessingResult> {
    let input = &config.input_path;
    let metadata = fs::metadata(input).map_err(|_| EngineError::NotFound {
        what: input.display().to_string(),
    })?;
    if metadata.is_dir() {
        return Err(EngineError::IsDirectory {
            path: input.clone(),
        });
    }
    let total_size = metadata.len();

    let output = config
        .output_path
        .clone()
        .unwrap_or_else(|| input.clone());

    let mode_used = match config.mode {
        ProcessingMode::Auto => {
            if total_size <= AUTO_FULL_MAX {
                ProcessingMode::Full
            } else {
                ProcessingMode::Line
            }
        },
        explicit => explicit,
    };

    let backup_id = if config.create_backup && !config.dry_run && output.exists() {
        let id = engine
            .backups
            .create(&output, "process_file", &format!("{mode_used:?} transform"))?;
        engine.telemetry.record_backup();
        Some(id)
    } else {
        None
    };

    cancel.checkpoint()?;

    let run = match mode_used {
        ProcessingMode::Full => run_full(input, &output, total_size, config, cancel, process_fn),
        ProcessingMode::Line => run_line(input, &output, total_size, config, cancel, process_fn),
        ProcessingMode::Chunk => {
            run_chunk(engine, input, &output, total_size, config, cancel, process_fn)
        },
        ProcessingMode::Auto => unreachable!("auto resolved above"),
    };
    let stats = run?;

    if !config.dry_run {
        engine.cache.invalidate(&output);
        engine.notify_sync(&output);
    }

    debug!(
        input = %input.display(),
        output = %output.display(),
        mode = ?mode_used,
        units = stats.units_processed,
        failed = stats.units_failed,
        "processing finished"
    );

    Ok(ProcessingResult {
        input_path: input.clone(),
        output_path: output,
        mode_used,
        units_processed: stats.units_processed,
        units_failed: stats.units_failed,
        unit_errors: stats.unit_errors,
        transformed: stats.transformed,
        bytes_written: stats.bytes_written,
        backup_id,
        dry_run: config.dry_run,
    })
}

#[derive(Default)]
struct RunStats {
    units_processed: u64,
    units_failed: u64,
    unit_errors: Vec<String>,
    transformed: bool,
    bytes_written: u64,
}

impl RunStats {
    fn record_error(&mut self, message: String) {
        self.units_failed += 1;
        if self.unit_errors.len() < UNIT_ERROR_CAP {
            self.unit_errors.push(message);
        }
    }
}

/// Shared output side: a buffered writer over a guarded temp file, or a
/// byte sink in dry-run mode.
enum Sink {
    File {
        writer: BufWriter<File>,
        guard: TempGuard,
        target: PathBuf,
    },
    DryRun,
}

impl Sink {
    fn open(output: &Path, dry_run: bool) -> EngineResult<Self> {
        if dry_run {
            return Ok(Self::DryRun);
        }
        let temp_path = temp_sibling(output);
        let guard = TempGuard::new(temp_path);
        let writer = BufWriter::new(File::create(guard.path())?);
        Ok(Self::File {
            writer,
            guard,
            target: output.to_path_buf(),
        })
    }

    fn write(&mut self, bytes: &[u8], stats: &mut RunStats) -> EngineResult<()> {
        stats.bytes_written += bytes.len() as u64;
        if let Self::File { writer, .. } = self {
            writer.write_all(bytes)?;
        }
        Ok(())
    }

    fn finish(self) -> EngineResult<()> {
        if let Self::File {
            mut writer,
            guard,
            target,
        } = self
        {
            writer.flush()?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            drop(file);

            if let Ok(metadata) = fs::metadata(&target) {
                fs::set_permissions(guard.path(), metadata.permissions())?;
            }
            fs::rename(guard.path(), &target)?;
            guard.commit();
        }
        Ok(())
    }
}

fn run_full(
    input: &Path,
    output: &Path,
    total_size: u64,
    config: &ProcessingConfig,
    cancel: &CancellationToken,
    process_fn: ProcessFn<'_>,
) -> EngineResult<RunStats> {
    let mut stats = RunStats::default();

    cancel.checkpoint()?;
    let content = fs::read(input)?;

    let info = UnitInfo {
        file: input,
        total_size,
        line_number: None,
        chunk_index: None,
        total_chunks: None,
    };

    let out = match process_fn(&content, &info) {
        Ok(out) => {
            stats.units_processed = 1;
            if out != content {
                stats.transformed = true;
            }
            out
        },
        Err(message) => {
            stats.record_error(message);
            content.clone()
        },
    };

    let mut sink = Sink::open(output, config.dry_run)?;
    sink.write(&out, &mut stats)?;
    cancel.checkpoint()?;
    sink.finish()?;
    Ok(stats)
}

fn run_line(
    input: &Path,
    output: &Path,
    total_size: u64,
    config: &ProcessingConfig,
    cancel: &CancellationToken,
    process_fn: ProcessFn<'_>,
) -> EngineResult<RunStats> {
    let mut stats = RunStats::default();
    // Large capacity: line mode must cope with very long lines.
    let mut reader = BufReader::with_capacity(1024 * 1024, File::open(input)?);
    let mut sink = Sink::open(output, config.dry_run)?;

    let mut line_buf: Vec<u8> = Vec::new();
    let mut line_number = 0u64;

    loop {
        line_buf.clear();
        let read = reader.read_until(b'\n', &mut line_buf)?;
        if read == 0 {
            break;
        }
        line_number += 1;

        if line_number % CANCEL_POLL_LINES == 0 {
            cancel.checkpoint()?;
        }

        let had_newline = line_buf.last() == Some(&b'\n');
        let line = if had_newline {
            &line_buf[..line_buf.len() - 1]
        } else {
            &line_buf[..]
        };

        let info = UnitInfo {
            file: input,
            total_size,
            line_number: Some(line_number),
            chunk_index: None,
            total_chunks: None,
        };

        match process_fn(line, &info) {
            Ok(out) => {
                if out != line {
                    stats.transformed = true;
                }
                sink.write(&out, &mut stats)?;
            },
            Err(message) => {
                stats.record_error(format!("line {line_number}: {message}"));
                sink.write(line, &mut stats)?;
            },
        }
        // The separator belongs to the source line, so the final newline
        // only appears when the source ended with one.
        if had_newline {
            sink.write(b"\n", &mut stats)?;
        }
        stats.units_processed += 1;
    }

    cancel.checkpoint()?;
    sink.finish()?;
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn run_chunk(
    engine: &Engine,
    input: &Path,
    output: &Path,
    total_size: u64,
    config: &ProcessingConfig,
    cancel: &CancellationToken,
    process_fn: ProcessFn<'_>,
) -> EngineResult<RunStats> {
    let mut stats = RunStats::default();
    let chunk_size = config.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1);
    let total_chunks = (total_size as usize).div_ceil(chunk_size).max(1);

    let mut reader = File::open(input)?;
    let mut sink = Sink::open(output, config.dry_run)?;

    let mut slab = engine.buffers.acquire();
    if slab.len() < chunk_size {
        slab.resize(chunk_size, 0);
    }

    let mut chunk_index = 0usize;
    loop {
        let read = read_exact_or_less(&mut reader, &mut slab[..chunk_size])?;
        if read == 0 {
            break;
        }
        let chunk = &slab[..read];

        let info = UnitInfo {
            file: input,
            total_size,
            line_number: None,
            chunk_index: Some(chunk_index),
            total_chunks: Some(total_chunks),
        };

        match process_fn(chunk, &info) {
            Ok(out) => {
                if out != chunk {
                    stats.transformed = true;
                }
                sink.write(&out, &mut stats)?;
            },
            Err(message) => {
                stats.record_error(format!("chunk {chunk_index}: {message}"));
                sink.write(chunk, &mut stats)?;
            },
        }
        stats.units_processed += 1;
        chunk_index += 1;

        // Sink's guard removes the temp file when we bail here.
        cancel.checkpoint()?;
    }

    sink.finish()?;
    engine.buffers.release(slab);
    Ok(stats)
}

/// Fill `buf` as far as the reader allows; short reads near EOF are fine.
fn read_exact_or_less(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
