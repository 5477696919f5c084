use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use aho_corasick::AhoCorasick;
use bstr::ByteSlice;
use content_inspector::{inspect, ContentType};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use memmap2::Mmap;
use parking_lot::Mutex;
use rayon::prelude::*;
use regex::bytes::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Closed set of extensions that are text without sniffing.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "rst", "adoc", "rs", "go", "py", "js", "jsx", "ts", "tsx", "c", "h", "cpp",
    "hpp", "cc", "cs", "java", "kt", "swift", "rb", "php", "pl", "sh", "bash", "zsh", "fish",
    "ps1", "bat", "cmd", "html", "htm", "xml", "css", "scss", "less", "json", "yaml", "yml",
    "toml", "ini", "cfg", "conf", "env", "sql", "graphql", "proto", "lua", "vim", "el", "clj",
    "ex", "exs", "erl", "hs", "ml", "scala", "dart", "r", "jl", "tex", "bib", "csv", "tsv",
    "log", "lock", "gitignore", "dockerfile", "makefile",
];

/// Bytes sniffed for NUL when the extension is not in the closed set.
const BINARY_SNIFF_LEN: usize = 512;
/// Reads over this size go through a memory map.
const MMAP_THRESHOLD: u64 = 256 * 1024;
/// Walks poll cancellation this often.
const CANCEL_POLL_ENTRIES: usize = 1000;

/// A content match with byte coordinates inside its line.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub file: PathBuf,
    /// 1-based.
    pub line_number: u64,
    /// The line verbatim, without its terminator, no trimming.
    pub line: String,
    /// Byte offsets of the first occurrence within the line,
    /// `[match_start, match_end)`.
    pub match_start: usize,
    pub match_end: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub filename_matches: Vec<PathBuf>,
    pub content_matches: Vec<SearchMatch>,
    pub files_scanned: usize,
    pub truncated: bool,
}

/// A match from `advanced_text_search`, optionally with context lines.
#[derive(Debug, Clone, Serialize)]
pub struct GrepMatch {
    pub file: PathBuf,
    pub line_number: u64,
    pub line: String,
    pub match_start: usize,
    pub match_end: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context_before: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context_after: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GrepOptions {
    pub case_sensitive: bool,
    pub whole_word: bool,
    pub include_context: bool,
    pub context_lines: usize,
}

/// Per-file occurrence counts.
#[derive(Debug, Clone, Serialize)]
pub struct CountOutcome {
    pub counts: BTreeMap<PathBuf, usize>,
    pub total: usize,
    /// 1-based line numbers per file, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<BTreeMap<PathBuf, Vec<u64>>>,
}

/// Compile a search pattern as a regex, falling back to a literal match
/// when the pattern is not valid regex syntax.
pub fn compile_search_pattern(pattern: &str, case_sensitive: bool) -> Regex {
    let base = match Regex::new(pattern) {
        Ok(_) => pattern.to_string(),
        Err(_) => regex::escape(pattern),
    };
    let flagged = if case_sensitive || base.starts_with("(?") {
        base
    } else {
        format!("(?i){base}")
    };
    Regex::new(&flagged)
        .unwrap_or_else(|_| Regex::new(&regex::escape(pattern)).expect("escaped pattern compiles"))
}

/// Decide text-ness: closed-set extension map first, NUL sniff second.
pub fn is_text_file(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return true;
        }
    }

    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut head = [0u8; BINARY_SNIFF_LEN];
    let Ok(read) = file.read(&mut head) else {
        return false;
    };
    if read == 0 {
        return true;
    }
    inspect(&head[..read]) != ContentType::BINARY
}

fn read_content(path: &Path, size: u64) -> std::io::Result<Vec<u8>> {
    if size > MMAP_THRESHOLD {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(mmap.to_vec())
    } else {
        std::fs::read(path)
    }
}

/// Build a glob set matching the requested extensions, e.g. `["rs",
/// ".py"]` becomes `*.rs` and `*.py`. Empty input means no filter.
fn build_type_globset(file_types: &[String]) -> EngineResult<Option<GlobSet>> {
    if file_types.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for file_type in file_types {
        let ext = file_type.trim_start_matches('.');
        let glob = Glob::new(&format!("*.{ext}")).map_err(|e| EngineError::InvalidPattern {
            pattern: file_type.clone(),
            reason: e.to_string(),
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|e| EngineError::InvalidPattern {
        pattern: file_types.join(","),
        reason: e.to_string(),
    })?;
    Ok(Some(set))
}

/// Walk `root` collecting regular files, honoring ignore files and
/// skipping hidden entries the way the scanner conventions expect.
fn collect_files(
    root: &Path,
    file_types: &[String],
    cancel: &CancellationToken,
) -> EngineResult<Vec<PathBuf>> {
    let type_globs = build_type_globset(file_types)?;

    let mut builder = WalkBuilder::new(root);
    builder
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .ignore(true)
        .parents(true)
        .hidden(true);

    let mut files = Vec::new();
    for (index, entry) in builder.build().enumerate() {
        if index % CANCEL_POLL_ENTRIES == 0 {
            cancel.checkpoint()?;
        }
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        if let Some(ref globs) = type_globs {
            let matched = path
                .file_name()
                .is_some_and(|name| globs.is_match(Path::new(name)));
            if !matched {
                continue;
            }
        }
        files.push(path.to_path_buf());
    }
    Ok(files)
}

/// Search file names and, optionally, file contents under `root`.
///
/// File-name matching is unbounded by size; content search opens text
/// files only and skips files over the configured ceiling. Results are
/// capped at `max_search_results` and collected under a single mutex
/// from the parallel per-file scans.
pub fn smart_search(
    engine: &Engine,
    root: &Path,
    pattern: &str,
    include_content: bool,
    file_types: &[String],
    cancel: &CancellationToken,
) -> EngineResult<SearchOutcome> {
    let root = engine.guard.validate(root)?;
    if !root.exists() {
        return Err(EngineError::NotFound {
            what: root.display().to_string(),
        });
    }
    engine.telemetry.record_search();

    let regex = compile_search_pattern(pattern, true);
    let max_results = engine.config.limits.max_search_results;
    let max_file_size = engine.config.limits.search_max_file_size;

    let files = collect_files(&root, file_types, cancel)?;

    let mut filename_matches = Vec::new();
    for path in &files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if regex.is_match(name.as_bytes()) {
            filename_matches.push(path.clone());
            if filename_matches.len() >= max_results {
                break;
            }
        }
    }

    let mut truncated = filename_matches.len() >= max_results;
    let mut content_matches = Vec::new();
    let mut files_scanned = 0usize;

    if include_content {
        let collected: Mutex<Vec<SearchMatch>> = Mutex::new(Vec::new());
        let scanned = Mutex::new(0usize);

        engine.pool().install(|| {
            files.par_iter().for_each(|path| {
                if cancel.is_cancelled() {
                    return;
                }
                {
                    let found = collected.lock();
                    if found.len() >= max_results {
                        return;
                    }
                }
                let Ok(metadata) = std::fs::metadata(path) else {
                    return;
                };
                if metadata.len() > max_file_size || !is_text_file(path) {
                    return;
                }
                let Ok(content) = read_content(path, metadata.len()) else {
                    return;
                };
                *scanned.lock() += 1;

                let mut local = scan_lines(path, &content, &regex);
                if local.is_empty() {
                    return;
                }
                let mut found = collected.lock();
                let room = max_results.saturating_sub(found.len());
                local.truncate(room);
                found.extend(local);
            });
        });

        cancel.checkpoint()?;
        content_matches = collected.into_inner();
        content_matches.sort_by(|a, b| a.file.cmp(&b.file).then(a.line_number.cmp(&b.line_number)));
        files_scanned = scanned.into_inner();
        truncated = truncated || content_matches.len() >= max_results;
    }

    Ok(SearchOutcome {
        filename_matches,
        content_matches,
        files_scanned,
        truncated,
    })
}

/// Per-line scan reporting the first occurrence in each matching line.
fn scan_lines(path: &Path, content: &[u8], regex: &Regex) -> Vec<SearchMatch> {
    let mut matches = Vec::new();
    for (index, raw_line) in content.lines_with_terminator().enumerate() {
        let line = trim_terminator(raw_line);
        if let Some(found) = regex.find(line) {
            matches.push(SearchMatch {
                file: path.to_path_buf(),
                line_number: index as u64 + 1,
                line: String::from_utf8_lossy(line).into_owned(),
                match_start: found.start(),
                match_end: found.end(),
            });
        }
    }
    matches
}

fn trim_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Word characters for whole-word matching.
fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// True when `[start, end)` sits on word boundaries within `line`.
pub fn on_word_boundary(line: &[u8], start: usize, end: usize) -> bool {
    let left_ok = start == 0 || !is_word_byte(line[start - 1]);
    let right_ok = end >= line.len() || !is_word_byte(line[end]);
    left_ok && right_ok
}

/// Text search with case, whole-word, and context-line options.
pub fn advanced_text_search(
    engine: &Engine,
    root: &Path,
    pattern: &str,
    options: &GrepOptions,
    cancel: &CancellationToken,
) -> EngineResult<Vec<GrepMatch>> {
    let root = engine.guard.validate(root)?;
    engine.telemetry.record_search();

    let regex = compile_search_pattern(pattern, options.case_sensitive);
    let max_results = engine.config.limits.max_search_results;
    let max_file_size = engine.config.limits.search_max_file_size;

    let files = collect_files(&root, &[], cancel)?;
    let collected: Mutex<Vec<GrepMatch>> = Mutex::new(Vec::new());

    engine.pool().install(|| {
        files.par_iter().for_each(|path| {
            if cancel.is_cancelled() {
                return;
            }
            {
                let found = collected.lock();
                if found.len() >= max_results {
                    return;
                }
            }
            let Ok(metadata) = std::fs::metadata(path) else {
                return;
            };
            if metadata.len() > max_file_size || !is_text_file(path) {
                return;
            }
            let Ok(content) = read_content(path, metadata.len()) else {
                return;
            };

            let lines: Vec<&[u8]> = content
                .lines_with_terminator()
                .map(trim_terminator)
                .collect();

            let mut local = Vec::new();
            for (index, line) in lines.iter().enumerate() {
                let Some(found) = regex.find(line) else {
                    continue;
                };
                if options.whole_word
                    && !on_word_boundary(line, found.start(), found.end())
                {
                    continue;
                }

                let (context_before, context_after) = if options.include_context {
                    let from = index.saturating_sub(options.context_lines);
                    let to = (index + options.context_lines + 1).min(lines.len());
                    (
                        lines[from..index]
                            .iter()
                            .map(|l| String::from_utf8_lossy(l).into_owned())
                            .collect(),
                        lines[index + 1..to]
                            .iter()
                            .map(|l| String::from_utf8_lossy(l).into_owned())
                            .collect(),
                    )
                } else {
                    (Vec::new(), Vec::new())
                };

                local.push(GrepMatch {
                    file: path.to_path_buf(),
                    line_number: index as u64 + 1,
                    line: String::from_utf8_lossy(line).into_owned(),
                    match_start: found.start(),
                    match_end: found.end(),
                    context_before,
                    context_after,
                });
            }

            if local.is_empty() {
                return;
            }
            let mut found = collected.lock();
            let room = max_results.saturating_sub(found.len());
            local.truncate(room);
            found.extend(local);
        });
    });

    cancel.checkpoint()?;
    let mut matches = collected.into_inner();
    matches.sort_by(|a, b| a.file.cmp(&b.file).then(a.line_number.cmp(&b.line_number)));
    Ok(matches)
}

/// Count literal occurrences of `pattern` in a file or every text file
/// under a directory. Counting is non-overlapping, leftmost-first.
pub fn count_occurrences(
    engine: &Engine,
    path: &Path,
    pattern: &str,
    return_lines: bool,
    cancel: &CancellationToken,
) -> EngineResult<CountOutcome> {
    if pattern.is_empty() {
        return Err(EngineError::InvalidPattern {
            pattern: String::new(),
            reason: "pattern must not be empty".to_string(),
        });
    }
    let path = engine.guard.validate(path)?;
    let metadata = std::fs::metadata(&path).map_err(|_| EngineError::NotFound {
        what: path.display().to_string(),
    })?;

    let matcher = AhoCorasick::new([pattern]).map_err(|e| EngineError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let files = if metadata.is_dir() {
        collect_files(&path, &[], cancel)?
    } else {
        vec![path.clone()]
    };

    let max_file_size = engine.config.limits.search_max_file_size;
    let mut counts = BTreeMap::new();
    let mut lines: BTreeMap<PathBuf, Vec<u64>> = BTreeMap::new();
    let mut total = 0usize;

    for (index, file) in files.iter().enumerate() {
        if index % CANCEL_POLL_ENTRIES == 0 {
            cancel.checkpoint()?;
        }
        let Ok(metadata) = std::fs::metadata(file) else {
            continue;
        };
        if metadata.len() > max_file_size || !is_text_file(file) {
            continue;
        }
        let Ok(content) = read_content(file, metadata.len()) else {
            continue;
        };

        let file_count = matcher.find_iter(&content).count();
        if file_count == 0 {
            continue;
        }
        total += file_count;
        counts.insert(file.clone(), file_count);

        if return_lines {
            let mut hit_lines = Vec::new();
            for (line_index, raw_line) in content.lines_with_terminator().enumerate() {
                if matcher.is_match(trim_terminator(raw_line)) {
                    hit_lines.push(line_index as u64 + 1);
                }
            }
            lines.insert(file.clone(), hit_lines);
        }
    }

    Ok(CountOutcome {
        counts,
        total,
        lines: return_lines.then_some(lines),
    })
}
