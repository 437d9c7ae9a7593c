/// Named input/target streams loaded from NumPy .npy files
use ndarray::ArrayD;
use ndarray_npy::ReadNpyExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::BatchIterator;
use crate::backend::ArrayBackend;

fn default_steps() -> usize {
    1
}

/// One input stream in dataset.json
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputStream {
    /// .npy file relative to the dataset directory, samples on axis 0
    pub file: String,
    /// Recurrent elements per logical sample
    #[serde(default = "default_steps")]
    pub steps: usize,
}

/// Contents of dataset.json
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamManifest {
    pub inputs: Vec<InputStream>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Host-side streams ready to be moved onto a backend
pub struct StreamSet {
    inputs: Vec<ArrayD<f32>>,
    targets: Option<Vec<ArrayD<f32>>>,
    steps: Vec<usize>,
    manifest: StreamManifest,
}

/// Read an .npy file as f32, accepting f64 files as well
fn read_stream(path: &Path) -> crate::Result<ArrayD<f32>> {
    match ArrayD::<f32>::read_npy(BufReader::new(File::open(path)?)) {
        Ok(array) => Ok(array),
        Err(f32_err) => {
            let wide = ArrayD::<f64>::read_npy(BufReader::new(File::open(path)?)).map_err(|_| {
                crate::ZmlError::Npy(format!("Failed to read {}: {}", path.display(), f32_err))
            })?;
            log::debug!("{} stored as f64, narrowing to f32", path.display());
            Ok(wide.mapv(|x| x as f32))
        }
    }
}

impl StreamSet {
    /// Load from a directory containing dataset.json and the .npy files it names
    pub fn from_directory<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading streams from: {:?}", dir);

        let manifest_path = dir.join("dataset.json");
        let manifest: StreamManifest = {
            let reader = BufReader::new(File::open(&manifest_path)?);
            serde_json::from_reader(reader)?
        };

        if manifest.inputs.is_empty() {
            return Err(crate::ZmlError::Config(
                "dataset.json lists no input streams".to_string(),
            ));
        }

        let mut inputs = Vec::with_capacity(manifest.inputs.len());
        for stream in &manifest.inputs {
            let array = read_stream(&dir.join(&stream.file))?;
            log::info!(
                "Loaded input {}: shape {:?}, steps={}",
                stream.file,
                array.shape(),
                stream.steps
            );
            inputs.push(array);
        }

        let targets = if manifest.targets.is_empty() {
            log::warn!("No target streams listed, iterating inputs only");
            None
        } else {
            let mut targets = Vec::with_capacity(manifest.targets.len());
            for file in &manifest.targets {
                let array = read_stream(&dir.join(file))?;
                log::info!("Loaded target {}: shape {:?}", file, array.shape());
                targets.push(array);
            }
            Some(targets)
        };

        let steps = manifest.inputs.iter().map(|s| s.steps).collect();

        Ok(Self {
            inputs,
            targets,
            steps,
            manifest,
        })
    }

    pub fn manifest(&self) -> &StreamManifest {
        &self.manifest
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    /// Move the streams onto the backend as a batch iterator
    pub fn into_batch_iterator<B: ArrayBackend + Clone>(
        self,
        backend: &B,
    ) -> crate::Result<BatchIterator<B>> {
        BatchIterator::new(backend, self.inputs, self.targets, Some(self.steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CandleBackend;
    use ndarray::{Array, IxDyn};
    use ndarray_npy::WriteNpyExt;

    #[test]
    fn test_manifest_deserialization() {
        let json = r#"{
            "inputs": [{ "file": "words.npy", "steps": 8 }, { "file": "analytics.npy" }],
            "targets": ["labels.npy"]
        }"#;

        let manifest: StreamManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.inputs.len(), 2);
        assert_eq!(manifest.inputs[0].steps, 8);
        assert_eq!(manifest.inputs[1].steps, 1);
        assert_eq!(manifest.targets, vec!["labels.npy".to_string()]);
    }

    #[test]
    fn test_from_directory() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let words = Array::from_shape_fn(IxDyn(&[12, 5]), |ix| ix[0] as f32);
        words
            .write_npy(File::create(dir.path().join("words.npy"))?)
            .unwrap();
        let analytics = Array::from_shape_fn(IxDyn(&[4, 3]), |ix| ix[1] as f64);
        analytics
            .write_npy(File::create(dir.path().join("analytics.npy"))?)
            .unwrap();
        let labels = Array::from_shape_fn(IxDyn(&[4, 2]), |ix| (ix[0] % 2 == ix[1]) as u8 as f32);
        labels
            .write_npy(File::create(dir.path().join("labels.npy"))?)
            .unwrap();

        std::fs::write(
            dir.path().join("dataset.json"),
            r#"{ "inputs": [{ "file": "words.npy", "steps": 3 }, { "file": "analytics.npy" }],
                 "targets": ["labels.npy"], "description": "fixture" }"#,
        )?;

        let streams = StreamSet::from_directory(dir.path())?;
        assert_eq!(streams.num_inputs(), 2);
        assert_eq!(streams.steps(), &[3, 1]);
        assert_eq!(streams.manifest().description, "fixture");

        let backend = CandleBackend::cpu(2)?;
        let it = streams.into_batch_iterator(&backend)?;
        assert_eq!(it.ndata(), 4);
        assert_eq!(it.nbatches(), 2);
        assert_eq!(it.inputs()[0].dims(), &[5, 12]);

        Ok(())
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            StreamSet::from_directory(dir.path()),
            Err(crate::ZmlError::Io(_))
        ));
    }
}
