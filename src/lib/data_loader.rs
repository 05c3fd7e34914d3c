//! Loading raw signal reads from disk.
//!
//! The loader scans a data directory for `.sig` files (one read per line:
//! `read_id<TAB>comma-separated 16-bit samples`), applies the optional
//! read-list filter and the `max_reads` cap, and pushes read messages into
//! the pipeline source. A read id of the form `template;complement` marks a
//! two-strand consensus and loads as a [`DuplexRead`]; anything else loads
//! as a [`SimplexRead`]. Per-run metadata for the output header comes from
//! an optional `run_info.toml` sidecar next to the signal files.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::errors::{Result, SquallError};
use crate::messages::{DuplexRead, Message, ReadCommon, SimplexRead};
use crate::node::NodeHandle;
use crate::sam::ReadGroup;

/// File extension recognized as raw signal input.
const SIGNAL_EXTENSION: &str = "sig";

#[derive(Debug, Default, Deserialize)]
struct RunInfoToml {
    #[serde(default)]
    run: RunSection,
}

#[derive(Debug, Default, Deserialize)]
struct RunSection {
    flowcell_id: Option<String>,
    device_id: Option<String>,
    exp_start_time: Option<String>,
    run_id: Option<String>,
    sample_id: Option<String>,
}

/// Collect signal files under `data_path`, sorted for reproducible order.
fn collect_signal_files(data_path: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![data_path.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                if recursive {
                    dirs.push(path);
                }
            } else if path.extension().is_some_and(|e| e == SIGNAL_EXTENSION) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Load the newline-delimited read list, if one was given.
pub fn load_read_list(path: Option<&Path>) -> Result<Option<HashSet<String>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let file = std::fs::File::open(path)?;
    let mut ids = HashSet::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        let id = line.trim();
        if !id.is_empty() {
            ids.insert(id.to_string());
        }
    }
    Ok(Some(ids))
}

/// Build the read-group table from the run metadata sidecar.
///
/// Missing sidecar or missing fields fall back to `"unknown"`; the group id
/// is `{run_id}_{model_name}`.
pub fn load_read_groups(data_path: &Path, model_name: &str) -> Result<BTreeMap<String, ReadGroup>> {
    let sidecar = data_path.join("run_info.toml");
    let run = if sidecar.is_file() {
        let text = std::fs::read_to_string(&sidecar)?;
        let parsed: RunInfoToml =
            toml::from_str(&text).map_err(|e| SquallError::InvalidFileFormat {
                file_type: "run info".to_string(),
                path: sidecar.display().to_string(),
                reason: e.to_string(),
            })?;
        parsed.run
    } else {
        RunSection::default()
    };

    let unknown = || "unknown".to_string();
    let run_id = run.run_id.unwrap_or_else(unknown);
    let group = ReadGroup {
        flowcell_id: run.flowcell_id.unwrap_or_else(unknown),
        device_id: run.device_id.unwrap_or_else(unknown),
        exp_start_time: run.exp_start_time.unwrap_or_else(unknown),
        basecalling_model: model_name.to_string(),
        run_id: run_id.clone(),
        sample_id: run.sample_id.unwrap_or_else(unknown),
    };
    let mut groups = BTreeMap::new();
    groups.insert(format!("{run_id}_{model_name}"), group);
    Ok(groups)
}

/// Count the reads the loader would push, honouring filters and the cap.
pub fn get_num_reads(
    data_path: &Path,
    read_list: Option<&HashSet<String>>,
    max_reads: usize,
    recursive: bool,
) -> Result<usize> {
    let mut count = 0usize;
    for file in collect_signal_files(data_path, recursive)? {
        let reader = std::io::BufReader::new(std::fs::File::open(&file)?);
        for line in reader.lines() {
            let line = line?;
            let Some((read_id, _)) = line.split_once('\t') else {
                continue;
            };
            if read_list.is_some_and(|list| !list.contains(read_id)) {
                continue;
            }
            count += 1;
            if max_reads > 0 && count >= max_reads {
                return Ok(count);
            }
        }
    }
    Ok(count)
}

/// Streams reads from disk into the pipeline source.
pub struct DataLoader {
    sink: NodeHandle,
    model_stride: usize,
    read_group: String,
    read_list: Option<HashSet<String>>,
    max_reads: usize,
}

impl DataLoader {
    #[must_use]
    pub fn new(
        sink: NodeHandle,
        model_stride: usize,
        read_group: String,
        read_list: Option<HashSet<String>>,
        max_reads: usize,
    ) -> Self {
        Self { sink, model_stride, read_group, read_list, max_reads }
    }

    fn parse_line(&self, line: &str, path: &Path) -> Result<Option<Message>> {
        let Some((read_id, samples)) = line.split_once('\t') else {
            return Err(SquallError::InvalidFileFormat {
                file_type: "signal".to_string(),
                path: path.display().to_string(),
                reason: "line is missing the read id field".to_string(),
            });
        };
        if self.read_list.as_ref().is_some_and(|list| !list.contains(read_id)) {
            return Ok(None);
        }
        let raw_signal = samples
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().parse::<i16>())
            .collect::<std::result::Result<Vec<i16>, _>>()
            .map_err(|e| SquallError::InvalidFileFormat {
                file_type: "signal".to_string(),
                path: path.display().to_string(),
                reason: format!("bad sample value: {e}"),
            })?;

        let mut common = ReadCommon::default();
        common.read_id = read_id.to_string();
        common.raw_signal = raw_signal;
        common.model_stride = self.model_stride;
        common.read_group = self.read_group.clone();
        common.rna_poly_tail_length = -1;

        // A semicolon-joined id names the two strands of a consensus read.
        let msg = match read_id.split_once(';') {
            Some((template, complement)) if !template.is_empty() && !complement.is_empty() => {
                Message::DuplexRead(Box::new(DuplexRead {
                    common,
                    source_ids: (template.to_string(), complement.to_string()),
                }))
            }
            _ => Message::SimplexRead(Box::new(SimplexRead { common })),
        };
        Ok(Some(msg))
    }

    /// Push every read under `data_path` into the sink; returns the number
    /// of reads loaded. Malformed lines are logged and skipped.
    pub fn load_reads(&self, data_path: &Path, recursive: bool) -> Result<usize> {
        let mut loaded = 0usize;
        for file in collect_signal_files(data_path, recursive)? {
            let reader = std::io::BufReader::new(std::fs::File::open(&file)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match self.parse_line(&line, &file) {
                    Ok(Some(msg)) => {
                        if self.sink.push_message(msg).is_err() {
                            return Ok(loaded);
                        }
                        loaded += 1;
                        if self.max_reads > 0 && loaded >= self.max_reads {
                            return Ok(loaded);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("skipping malformed read: {e}"),
                }
            }
        }
        Ok(loaded)
    }
}
