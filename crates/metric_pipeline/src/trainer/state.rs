use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// A named, dense `f32` parameter block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        ensure!(
            expected == data.len(),
            "tensor {name}: shape {shape:?} needs {expected} values, got {}",
            data.len()
        );
        Ok(Self { name, shape, data })
    }
}

/// Serialized model: what the `train` command writes to its output file and
/// what the sync file holds between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// Engine that produced the state, e.g. `"linear-metric"`.
    pub kind: String,
    pub steps: u64,
    pub learning_rate: f64,
    pub params: Vec<NamedTensor>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ModelState {
    pub fn new(kind: impl Into<String>, steps: u64, learning_rate: f64) -> Self {
        Self {
            kind: kind.into(),
            steps,
            learning_rate,
            params: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, param: NamedTensor) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn param(&self, name: &str) -> Option<&NamedTensor> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Drops optimizer-only parameters (names starting with `optim.`).
    pub fn without_optimizer_state(mut self) -> Self {
        self.params.retain(|p| !p.name.starts_with("optim."));
        self
    }

    /// Writes the state as JSON.
    ///
    /// The file is written next to `path` under a temporary name and renamed
    /// into place, so a reader never sees a half-written file. On failure the
    /// temporary file is removed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = temp_path(path);
        let result = self.write_json(&tmp).and_then(|()| {
            fs::rename(&tmp, path)
                .with_context(|| format!("Failed to move {} to {}", tmp.display(), path.display()))
        });
        if result.is_err() {
            // Nothing may exist yet; a missing file is fine here.
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn write_json(&self, tmp: &Path) -> Result<()> {
        let file =
            File::create(tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)
            .with_context(|| format!("Failed to serialize model state to {}", tmp.display()))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush {}", tmp.display()))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let state: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse model state in {}", path.display()))?;
        for param in &state.params {
            let expected: usize = param.shape.iter().product();
            ensure!(
                expected == param.data.len(),
                "corrupt model state in {}: tensor {} has {} values for shape {:?}",
                path.display(),
                param.name,
                param.data.len(),
                param.shape
            );
        }
        Ok(state)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "model".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> ModelState {
        ModelState::new("linear-metric", 12, 0.01)
            .with_param(NamedTensor::new("weights", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap())
            .with_param(NamedTensor::new("optim.velocity", vec![4], vec![0.0; 4]).unwrap())
            .with_metadata("embedding_dim", 2)
    }

    #[test]
    fn test_save_then_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("face_metric_sync");
        let state = sample_state();
        state.save(&path)?;

        assert!(!dir.path().join("face_metric_sync.tmp").exists());
        assert_eq!(ModelState::load(&path)?, state);

        // Overwriting an existing file works too.
        let mut later = state.clone();
        later.steps = 20;
        later.save(&path)?;
        assert_eq!(ModelState::load(&path)?.steps, 20);
        Ok(())
    }

    #[test]
    fn test_failed_save_removes_temp_file() -> Result<()> {
        let dir = tempdir()?;
        // A non-empty directory in the way makes the final rename fail.
        let path = dir.path().join("face_metric_sync");
        fs::create_dir(&path)?;
        fs::write(path.join("keep"), b"x")?;

        assert!(sample_state().save(&path).is_err());
        assert!(!dir.path().join("face_metric_sync.tmp").exists());
        assert!(path.join("keep").exists());
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        assert!(NamedTensor::new("w", vec![3, 3], vec![0.0; 8]).is_err());

        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut state = sample_state();
        state.params[0].data.pop();
        state.save(&path).unwrap();
        assert!(ModelState::load(&path).is_err());
    }

    #[test]
    fn test_optimizer_state_can_be_stripped() {
        let clean = sample_state().without_optimizer_state();
        assert!(clean.param("weights").is_some());
        assert!(clean.param("optim.velocity").is_none());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempdir().unwrap();
        assert!(ModelState::load(dir.path().join("missing")).is_err());
    }
}
