//! Plain-text matrix files for persisted extrinsics
//!
//! One matrix row per line, whitespace-separated values in `{:.18e}`
//! notation. The translation file is a column: one value per line.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::CalibrationError;

/// Where the extrinsic translation and rotation are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationPaths {
    pub translation: PathBuf,
    pub rotation: PathBuf,
}

impl CalibrationPaths {
    pub fn new(translation: impl Into<PathBuf>, rotation: impl Into<PathBuf>) -> Self {
        Self {
            translation: translation.into(),
            rotation: rotation.into(),
        }
    }
}

pub(crate) fn format_rows<R: AsRef<[f64]>>(rows: &[R]) -> String {
    let mut out = String::new();
    for row in rows {
        let line: Vec<String> = row.as_ref().iter().map(|v| format!("{v:.18e}")).collect();
        out.push_str(&line.join(" "));
        out.push('\n');
    }
    out
}

/// Write every `(path, contents)` pair to a sibling temp file, then rename
/// them all into place. Nothing is renamed unless every write succeeded, so
/// a failure never leaves one new file next to an old one.
pub(crate) fn write_all_atomic(files: &[(&Path, &str)]) -> Result<(), CalibrationError> {
    let mut staged: Vec<(PathBuf, &Path)> = Vec::with_capacity(files.len());
    for &(path, contents) in files {
        match stage(path, contents) {
            Ok(tmp) => staged.push((tmp, path)),
            Err(err) => {
                for (tmp, _) in &staged {
                    let _ = fs::remove_file(tmp);
                }
                return Err(err);
            }
        }
    }
    for (i, (tmp, path)) in staged.iter().enumerate() {
        if let Err(source) = fs::rename(tmp, path) {
            for (tmp, _) in &staged[i..] {
                let _ = fs::remove_file(tmp);
            }
            return Err(CalibrationError::FileWrite {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    Ok(())
}

fn stage(path: &Path, contents: &str) -> Result<PathBuf, CalibrationError> {
    let write_err = |source| CalibrationError::FileWrite {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let tmp = tmp_path(path);
    let written = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(contents.as_bytes())?;
        file.sync_all()
    });
    if let Err(source) = written {
        let _ = fs::remove_file(&tmp);
        return Err(write_err(source));
    }
    Ok(tmp)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read every numeric token of a matrix file, keeping row structure.
pub(crate) fn read_rows(path: &Path) -> Result<Vec<Vec<f64>>, CalibrationError> {
    let text = fs::read_to_string(path).map_err(|source| CalibrationError::FileMissing {
        path: path.to_path_buf(),
        source,
    })?;
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|tok| !tok.is_empty())
            .map(|tok| {
                tok.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| CalibrationError::FileInvalid {
                        path: path.to_path_buf(),
                        reason: format!("line {}: `{tok}` is not a finite number", lineno + 1),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(row);
    }
    Ok(rows)
}
