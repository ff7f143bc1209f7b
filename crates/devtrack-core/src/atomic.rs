use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Writes `data` to a sibling temp file and renames it over `path`.
///
/// Readers observe either the previous content or the new content, never a
/// partial write.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("no parent dir for {}", path.display()),
        )
    })?;
    fs::create_dir_all(parent)?;

    let tmp = temp_path(path);
    if let Err(err) = write_synced(&tmp, data).and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), crate::SessionError> {
    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');
    write_atomic(path, &body)?;
    Ok(())
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
}
