use super::{HistoryEntry, HistoryError, HistoryState, HistoryStore, MessageId};
use fs2::FileExt;
use peerchat_common::{Direction, Fingerprint, Username};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// History persisted as one JSON document.
///
/// Every operation reads the file and every change rewrites it, under an
/// OS file lock on a `<file>.lock` sidecar. A messaging service and a
/// one-shot `send` in another process can therefore share the same file.
#[derive(Debug)]
pub struct JsonHistory {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Held while the sidecar lock file is locked; dropping it unlocks
struct FileLock(File);

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl JsonHistory {
    /// Open the history at `path`. A missing file is an empty history; a
    /// corrupt one is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let mut lock_name = path.file_name().map(OsString::from).unwrap_or_default();
        lock_name.push(".lock");
        let history = Self {
            lock_path: path.with_file_name(lock_name),
            path,
        };

        let _lock = history.lock_shared()?;
        history.read_state()?;
        Ok(history)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn lock_file(&self) -> Result<File, HistoryError> {
        std::fs::create_dir_all(self.directory())?;
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?)
    }

    fn lock_shared(&self) -> Result<FileLock, HistoryError> {
        let file = self.lock_file()?;
        FileExt::lock_shared(&file)?;
        Ok(FileLock(file))
    }

    fn lock_exclusive(&self) -> Result<FileLock, HistoryError> {
        let file = self.lock_file()?;
        FileExt::lock_exclusive(&file)?;
        Ok(FileLock(file))
    }

    fn read_state(&self) -> Result<HistoryState, HistoryError> {
        match std::fs::read_to_string(&self.path) {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HistoryState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a uniquely named temporary file and rename it over the
    /// history, so readers never see half a document. Caller holds the
    /// exclusive lock.
    fn write_state(&self, state: &HistoryState) -> Result<(), HistoryError> {
        let mut tmp = NamedTempFile::new_in(self.directory())?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, state)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Read, change and write back the state under the exclusive lock
    fn update<T>(
        &self,
        change: impl FnOnce(&mut HistoryState) -> Result<T, HistoryError>,
    ) -> Result<T, HistoryError> {
        let _lock = self.lock_exclusive()?;
        let mut state = self.read_state()?;
        let result = change(&mut state)?;
        self.write_state(&state)?;
        Ok(result)
    }

    fn read<T>(&self, view: impl FnOnce(&HistoryState) -> T) -> Result<T, HistoryError> {
        let _lock = self.lock_shared()?;
        Ok(view(&self.read_state()?))
    }
}

impl HistoryStore for JsonHistory {
    fn pinned_fingerprint(&self, chat: &Username) -> Result<Option<Fingerprint>, HistoryError> {
        self.read(|state| state.pinned_fingerprint(chat))
    }

    fn pin_fingerprint(&self, chat: &Username, fingerprint: Fingerprint) -> Result<(), HistoryError> {
        self.update(|state| state.pin_fingerprint(chat, fingerprint))
    }

    fn append(&self, chat: &Username, direction: Direction, content: &str) -> Result<MessageId, HistoryError> {
        self.update(|state| Ok(state.append(chat, direction, content)))
    }

    fn query(&self, chat: &Username) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.read(|state| state.query(chat))
    }

    fn chats(&self) -> Result<Vec<Username>, HistoryError> {
        self.read(|state| state.chats())
    }
}
