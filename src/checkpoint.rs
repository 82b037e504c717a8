use crate::config::{
    CHECKPOINT_FILE, CHECKPOINT_VERSION, DATA_DIR, QUEUE_CHECKPOINT_FILE, RESULT_FILE,
};
use crate::models::{ScrapeKind, ScrapeStatus};
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// On-disk home of one scrape: its checkpoint, raw artifacts and result table.
///
/// ```text
/// <root>/
///   checkpoint.json | queue.csv
///   data/
///   result.csv
/// ```
#[derive(Debug, Clone)]
pub struct Namespace {
    root: PathBuf,
}

impl Namespace {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let data = root.join(DATA_DIR);
        fs::create_dir_all(&data)
            .with_context(|| format!("Failed to create namespace directory: {:?}", data))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn result_path(&self) -> PathBuf {
        self.root.join(RESULT_FILE)
    }

    pub fn store(&self) -> CheckpointStore {
        CheckpointStore {
            root: self.root.clone(),
        }
    }

    /// Identifies which kind of scrape owns this namespace, if any.
    pub fn detect_kind(&self) -> Result<Option<ScrapeKind>> {
        if self.root.join(QUEUE_CHECKPOINT_FILE).exists() {
            return Ok(Some(ScrapeKind::Queue));
        }
        let path = self.root.join(CHECKPOINT_FILE);
        if !path.exists() {
            return Ok(None);
        }

        #[derive(Deserialize)]
        struct KindOnly {
            kind: ScrapeKind,
        }

        let file = File::open(&path)
            .with_context(|| format!("Failed to open checkpoint file: {:?}", path))?;
        let header: KindOnly = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Checkpoint has no readable kind: {:?}", path))?;
        Ok(Some(header.kind))
    }
}

/// A persisted progress record.
///
/// Each scrape kind picks its own internal shape; the store only needs to
/// encode, decode and report status.
pub trait Checkpoint: Sized {
    const FILE_NAME: &'static str;

    fn status(&self) -> ScrapeStatus;

    fn encode<W: Write>(&self, writer: W) -> Result<()>;

    fn decode<R: Read>(reader: R) -> Result<Self>;
}

pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn path_for<C: Checkpoint>(&self) -> PathBuf {
        self.root.join(C::FILE_NAME)
    }

    /// Loads the persisted checkpoint, or `None` when the namespace is fresh.
    ///
    /// An unreadable checkpoint is an error rather than `None`: starting over
    /// silently would re-fetch everything already paid for.
    pub fn resume<C: Checkpoint>(&self) -> Result<Option<C>> {
        let path = self.path_for::<C>();
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(&path)
            .with_context(|| format!("Failed to open checkpoint file: {:?}", path))?;
        let checkpoint = C::decode(BufReader::new(file)).with_context(|| {
            format!(
                "Checkpoint at {:?} is unreadable; move it aside to start a new scrape",
                path
            )
        })?;

        info!(path = ?path, status = %checkpoint.status(), "Resuming scrape from checkpoint");
        Ok(Some(checkpoint))
    }

    /// Atomically replaces the persisted checkpoint (temp file + rename).
    pub fn save<C: Checkpoint>(&self, checkpoint: &C) -> Result<()> {
        let path = self.path_for::<C>();
        let mut buf = Vec::new();
        checkpoint
            .encode(&mut buf)
            .context("Failed to serialize checkpoint")?;
        write_atomic(&path, &buf)?;
        debug!(path = ?path, status = %checkpoint.status(), "Checkpoint saved");
        Ok(())
    }
}

/// Writes `bytes` to `path` so readers see either the old or the new file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", tmp_path))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(bytes)
        .with_context(|| format!("Failed to write temp file: {:?}", tmp_path))?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("Failed to flush temp file: {:?}", tmp_path))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync temp file: {:?}", tmp_path))?;

    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename temp file to: {:?}", path))?;
    Ok(())
}

pub fn write_json_artifact(path: &Path, value: &serde_json::Value) -> Result<()> {
    let bytes = serde_json::to_vec(value).context("Failed to serialize artifact")?;
    write_atomic(path, &bytes)
}

pub fn read_json_artifact(path: &Path) -> Result<serde_json::Value> {
    let file =
        File::open(path).with_context(|| format!("Failed to open artifact: {:?}", path))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Artifact is not valid JSON: {:?}", path))
}

/// Versioned JSON body shared by the chunk and cursor checkpoints.
pub(crate) fn encode_json<T: Serialize, W: Write>(value: &T, writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

pub(crate) fn decode_json<T: DeserializeOwned, R: Read>(
    reader: R,
    version: impl Fn(&T) -> u32,
) -> Result<T> {
    let value: T = serde_json::from_reader(reader)?;
    let found = version(&value);
    if found != CHECKPOINT_VERSION {
        bail!(
            "checkpoint version {} does not match supported version {}",
            found,
            CHECKPOINT_VERSION
        );
    }
    Ok(value)
}
