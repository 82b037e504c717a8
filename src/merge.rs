use crate::checkpoint::read_json_artifact;
use crate::config::TABLE_BUFFER_SIZE;
use crate::extract::Extractor;
use anyhow::{bail, Context, Result};
use csv::{Reader, Writer};
use rustc_hash::FxHashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Written {
        path: PathBuf,
        rows: usize,
        duplicates: usize,
    },
    /// The table existed and `force` was not set
    Skipped { path: PathBuf },
}

impl MergeOutcome {
    pub fn path(&self) -> &Path {
        match self {
            MergeOutcome::Written { path, .. } | MergeOutcome::Skipped { path } => path,
        }
    }
}

/// JSON artifacts in `data_dir`, in file-name order.
pub fn artifact_paths(data_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(data_dir)
        .with_context(|| format!("Failed to list artifacts in: {:?}", data_dir))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Writes the table through a sibling temp file so a crash never leaves a
/// half-written result behind.
fn with_table<F>(output: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut Writer<BufWriter<File>>) -> Result<()>,
{
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = output.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut writer = Writer::from_writer(BufWriter::with_capacity(
        TABLE_BUFFER_SIZE,
        File::create(&tmp_path).with_context(|| format!("Failed to create table: {:?}", tmp_path))?,
    ));
    write(&mut writer)?;
    writer.flush()?;
    drop(writer);

    fs::rename(&tmp_path, output)
        .with_context(|| format!("Failed to move table into place: {:?}", output))?;
    Ok(())
}

/// Flattens every artifact in `data_dir` into one table at `output`.
///
/// Rows are deduplicated on the extractor's key, keeping the first occurrence
/// in artifact order. A row whose key columns are all empty cannot be
/// identified and is always kept.
pub fn merge_artifacts<E: Extractor + ?Sized>(
    data_dir: &Path,
    extractor: &E,
    output: &Path,
    force: bool,
) -> Result<MergeOutcome> {
    if output.exists() && !force {
        info!(path = ?output, "Table already exists, skipping");
        return Ok(MergeOutcome::Skipped {
            path: output.to_path_buf(),
        });
    }

    let columns = extractor.columns();
    let key_idx: Vec<usize> = extractor
        .key()
        .iter()
        .map(|k| {
            columns
                .iter()
                .position(|c| c == k)
                .with_context(|| format!("Key column '{}' is not in the table", k))
        })
        .collect::<Result<_>>()?;

    let paths = artifact_paths(data_dir)?;
    info!(artifacts = paths.len(), path = ?output, "Creating table from artifacts");

    let mut seen_keys: FxHashSet<Vec<String>> = FxHashSet::default();
    let mut rows = 0usize;
    let mut duplicates = 0usize;

    with_table(output, |writer| {
        writer.write_record(columns)?;
        for path in &paths {
            let artifact = read_json_artifact(path)?;
            let extracted = extractor.extract(&artifact);
            debug!(artifact = ?path, rows = extracted.len(), "Extracted artifact");

            for row in extracted {
                let key: Vec<String> = key_idx.iter().map(|&i| row[i].clone()).collect();
                let identifiable = key.iter().any(|k| !k.is_empty());
                if identifiable && !seen_keys.insert(key) {
                    duplicates += 1;
                    continue;
                }
                writer.write_record(&row)?;
                rows += 1;
            }
        }
        Ok(())
    })?;

    info!(path = ?output, rows, duplicates, "Table written");
    Ok(MergeOutcome::Written {
        path: output.to_path_buf(),
        rows,
        duplicates,
    })
}

/// Concatenates tables sharing one header into `output`; returns data rows.
pub fn concat_tables(inputs: &[PathBuf], output: &Path) -> Result<usize> {
    let mut header = None;
    let mut rows = 0usize;

    with_table(output, |writer| {
        for input in inputs {
            let mut reader = Reader::from_reader(BufReader::new(
                File::open(input).with_context(|| format!("Failed to open table: {:?}", input))?,
            ));
            let this_header = reader.headers()?.clone();
            if let Some(first) = &header {
                if *first != this_header {
                    bail!("Table {:?} has a different header than the first table", input);
                }
            } else {
                writer.write_record(&this_header)?;
                header = Some(this_header);
            }

            for result in reader.records() {
                writer.write_record(&result?)?;
                rows += 1;
            }
        }
        Ok(())
    })?;

    info!(tables = inputs.len(), rows, path = ?output, "Tables concatenated");
    Ok(rows)
}
