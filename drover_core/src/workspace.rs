use crate::error::EngineError;
use crate::session::SessionId;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directories owned by one session: `<work_root>/<session-id>/{corpus,crashes}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
    corpus_dir: PathBuf,
    crashes_dir: PathBuf,
}

impl Workspace {
    pub fn allocate(work_root: &Path, session_id: SessionId) -> Result<Self, EngineError> {
        let root = work_root.join(session_id.to_string());
        let corpus_dir = root.join("corpus");
        let crashes_dir = root.join("crashes");
        for dir in [&corpus_dir, &crashes_dir] {
            fs::create_dir_all(dir).map_err(|e| EngineError::workspace(dir, e))?;
        }
        debug!(session = %session_id, root = %root.display(), "Allocated workspace");
        Ok(Self {
            root,
            corpus_dir,
            crashes_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn corpus_dir(&self) -> &Path {
        &self.corpus_dir
    }

    pub fn crashes_dir(&self) -> &Path {
        &self.crashes_dir
    }

    /// Copies seed inputs into the corpus directory and returns how many were
    /// copied. A directory contributes its top-level regular files; a file is
    /// copied as is. The source is only read.
    pub fn seed_corpus(&self, source: &Path) -> Result<usize, EngineError> {
        let metadata = fs::metadata(source).map_err(|e| EngineError::workspace(source, e))?;
        if metadata.is_file() {
            self.copy_seed(source)?;
            return Ok(1);
        }

        let entries = fs::read_dir(source).map_err(|e| EngineError::workspace(source, e))?;
        let mut copied = 0;
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::workspace(source, e))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| EngineError::workspace(&path, e))?;
            // Follow symlinks to regular files; skip nested directories.
            if file_type.is_file() || (file_type.is_symlink() && path.is_file()) {
                self.copy_seed(&path)?;
                copied += 1;
            } else {
                warn!(path = %path.display(), "Skipping non-file corpus entry");
            }
        }
        debug!(copied, source = %source.display(), "Seeded corpus");
        Ok(copied)
    }

    fn copy_seed(&self, path: &Path) -> Result<(), EngineError> {
        let Some(name) = path.file_name() else {
            return Err(EngineError::workspace(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "seed has no file name"),
            ));
        };
        let dest = self.corpus_dir.join(name);
        fs::copy(path, &dest).map_err(|e| EngineError::workspace(&dest, e))?;
        Ok(())
    }

    /// Whether the corpus directory holds no entries.
    pub fn corpus_is_empty(&self) -> Result<bool, EngineError> {
        let mut entries =
            fs::read_dir(&self.corpus_dir).map_err(|e| EngineError::workspace(&self.corpus_dir, e))?;
        Ok(entries.next().is_none())
    }
}
