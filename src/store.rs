use anyhow::Result;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Directory of normalized image artifacts, one JPEG per registration,
/// addressed by the file name recorded in its block.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Persist normalized bytes under `<fingerprint>.jpg` and return the
    /// file name. Write goes to a temp file first, then renames into place.
    pub fn store(&self, fingerprint: &str, bytes: &[u8]) -> Result<String> {
        fs::create_dir_all(&self.dir)?;
        let name = format!("{fingerprint}.jpg");
        let tmp = self.dir.join(format!("{name}.tmp"));
        let dest = self.dir.join(&name);
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            let _ = f.sync_all(); // best-effort
        }
        fs::rename(&tmp, &dest)?;
        Ok(name)
    }

    /// Bytes of a stored artifact, or `None` when the file is missing or
    /// the name is not a plain file name. Missing artifacts are an expected
    /// condition for the duplicate scan, not an error.
    pub fn retrieve(&self, name: &str) -> Option<Vec<u8>> {
        if !is_plain_file_name(name) {
            return None;
        }
        fs::read(self.dir.join(name)).ok()
    }
}

/// Reject anything that could escape the store directory.
fn is_plain_file_name(name: &str) -> bool {
    let path = Path::new(name);
    let mut components = path.components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}
