use async_std::fs;
use async_std::fs::{File, OpenOptions};
use async_std::path::{Path, PathBuf};
use bytes::Bytes;
use futures::{AsyncWriteExt, StreamExt};
use std::io::ErrorKind;
use tracing::{debug, info};

use crate::stm::error::{StmError, StmResult};

const PARTIAL_INFIX: &str = ".partial";

// Manages the single on-disk snapshot artifact for one state machine
// instance. Writes go to a uniquely named partial file which is renamed over
// the final path only once fully flushed, so a reader never observes a
// half-written snapshot.
pub struct SnapshotManager {
    directory: String,
    name: String,
}

impl SnapshotManager {
    pub async fn new(directory: &str, name: &str) -> StmResult<Self> {
        create_dir_if_not_exists(directory).await?;
        Ok(SnapshotManager {
            directory: directory.to_string(),
            name: name.to_string(),
        })
    }

    // Full path of the snapshot artifact managed by this instance.
    pub fn snapshot_path(&self) -> PathBuf {
        Path::new(self.directory.as_str()).join(self.name.as_str())
    }

    // Returns the entire snapshot contents, or None if no snapshot has been
    // written yet.
    pub async fn open_snapshot(&self) -> StmResult<Option<Bytes>> {
        match fs::read(self.snapshot_path()).await {
            Ok(contents) => Ok(Some(Bytes::from(contents))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StmError::Io(e)),
        }
    }

    // Opens a fresh partial file for a new snapshot write.
    pub async fn start_snapshot(&self) -> StmResult<SnapshotWriter> {
        let file_name = format!(
            "{}{}.{:08x}",
            self.name,
            PARTIAL_INFIX,
            rand::random::<u32>()
        );
        let partial_path = Path::new(self.directory.as_str()).join(file_name.as_str());
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(partial_path.clone())
            .await?;
        Ok(SnapshotWriter { file, partial_path })
    }

    // Promotes a finished partial write to be the snapshot. The rename is
    // atomic, a crash before it leaves no valid-looking snapshot behind.
    pub async fn finish_snapshot(&self, writer: SnapshotWriter) -> StmResult<()> {
        let SnapshotWriter {
            mut file,
            partial_path,
        } = writer;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(partial_path, self.snapshot_path()).await?;
        debug!("Finished snapshot {}", self.snapshot_path().display());
        Ok(())
    }

    // Removes left-over partial files from writes interrupted by a crash.
    pub async fn remove_partial_snapshots(&self) -> StmResult<()> {
        let prefix = format!("{}{}", self.name, PARTIAL_INFIX);
        let mut entries = fs::read_dir(self.directory.as_str()).await?;
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            let file_name = entry.file_name();
            if file_name.to_string_lossy().starts_with(prefix.as_str()) {
                info!("Removing partial snapshot {:?}", file_name);
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

// An in-progress snapshot write. Dropping the writer without finishing it
// leaves a partial file behind, cleaned up by remove_partial_snapshots after
// the next successful read.
pub struct SnapshotWriter {
    file: File,
    partial_path: PathBuf,
}

impl SnapshotWriter {
    pub async fn write(&mut self, data: &[u8]) -> StmResult<()> {
        self.file.write_all(data).await?;
        Ok(())
    }
}

async fn create_dir_if_not_exists(directory: &str) -> StmResult<()> {
    match fs::metadata(directory).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(StmError::Io(std::io::Error::other(format!(
            "Path exists but is not a directory: {}",
            directory
        )))),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(directory).await?;
            Ok(())
        }
        Err(e) => Err(StmError::Io(e)),
    }
}
