//! Iteration-indexed checkpoint files.
//!
//! A store writes one file per save event, named `{prefix}:{iteration:06}.ckpt`. The payload is a
//! named MessagePack record, so every component in the saved collection is keyed by its field
//! name and restored by name.

use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Record, Recorder};
use tracing::{debug, info, warn};

use crate::error::{Result, TrainError};

pub const CHECKPOINT_EXTENSION: &str = "ckpt";

/// State that can be persisted through a [`CheckpointIo`].
pub trait Checkpointable<B: Backend>: Sized {
    type Record: Record<B>;

    fn to_record(&self) -> Self::Record;

    fn load_record(self, record: Self::Record) -> Self;
}

/// Saves and restores one named collection under a fixed file-name prefix.
#[derive(Debug, Clone)]
pub struct CheckpointIo {
    dir: PathBuf,
    prefix: String,
}

impl CheckpointIo {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Path of the file holding `iteration`.
    pub fn path(&self, iteration: usize) -> PathBuf {
        self.dir.join(checkpoint_file_name(&self.prefix, iteration))
    }

    /// Write `state` for `iteration`, then drop the file `retention` iterations older.
    ///
    /// A `retention` of zero keeps every file. Removing a file that is not there is a no-op.
    pub fn save<B, C>(&self, state: &C, iteration: usize, retention: usize) -> Result<PathBuf>
    where
        B: Backend,
        C: Checkpointable<B>,
    {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(iteration);
        let bytes = encode_record::<B, _>(state.to_record())?;
        fs::write(&path, bytes)?;
        info!("Saving checkpoint into {}...", path.display());

        if retention > 0
            && let Some(stale) = iteration.checked_sub(retention)
        {
            let stale_path = self.path(stale);
            match fs::remove_file(&stale_path) {
                Ok(()) => debug!("removed stale checkpoint {}", stale_path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(path)
    }

    /// Restore `state` from the file for `iteration`.
    pub fn load<B, C>(&self, state: C, iteration: usize, device: &B::Device) -> Result<C>
    where
        B: Backend,
        C: Checkpointable<B>,
    {
        let path = self.path(iteration);
        if !path.is_file() {
            return Err(TrainError::MissingCheckpoint(path));
        }
        info!("Loading checkpoint from {}...", path.display());
        let bytes = fs::read(&path)?;
        let record = decode_record::<B, C::Record>(bytes, device)?;
        Ok(state.load_record(record))
    }

    /// Highest iteration saved under this prefix, if any.
    pub fn latest_iteration(&self) -> Result<Option<usize>> {
        Ok(list_checkpoints(&self.dir, &self.prefix)?
            .into_iter()
            .map(|name| name.iteration)
            .max())
    }
}

/// `name` and `iteration` encoded in a checkpoint file name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckpointName {
    pub name: String,
    pub iteration: usize,
    /// The parsed file name, which need not be zero-padded.
    pub file_name: String,
}

impl CheckpointName {
    /// Parse `{name}:{iteration}.{ext}`. Returns `None` for anything else.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (name, rest) = file_name.split_once(':')?;
        let digits = rest.split('.').next()?;
        if name.is_empty() || digits.is_empty() {
            return None;
        }
        let iteration = digits.parse().ok()?;
        Some(Self {
            name: name.to_string(),
            iteration,
            file_name: file_name.to_string(),
        })
    }
}

pub fn checkpoint_file_name(name: &str, iteration: usize) -> String {
    format!("{name}:{iteration:06}.{CHECKPOINT_EXTENSION}")
}

/// Every parseable `.ckpt` file in `dir` saved under `name`.
///
/// Files with another extension are ignored, and `.ckpt` names the codec rejects are skipped
/// with a warning. A missing directory yields an empty list.
pub fn list_checkpoints(dir: &Path, name: &str) -> Result<Vec<CheckpointName>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let is_checkpoint = Path::new(file_name)
            .extension()
            .is_some_and(|ext| ext == CHECKPOINT_EXTENSION);
        if !is_checkpoint || !file_name.starts_with(name) {
            continue;
        }
        match CheckpointName::parse(file_name) {
            Some(parsed) if parsed.name == name => found.push(parsed),
            Some(_) => {}
            None => warn!("skipping malformed checkpoint file name {file_name}"),
        }
    }
    found.sort();
    Ok(found)
}

pub(crate) fn encode_record<B: Backend, R: Record<B>>(record: R) -> Result<Vec<u8>> {
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
    Ok(Recorder::<B>::record(&recorder, record, ())?)
}

pub(crate) fn decode_record<B: Backend, R: Record<B>>(
    bytes: Vec<u8>,
    device: &B::Device,
) -> Result<R> {
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
    Ok(Recorder::<B>::load(&recorder, bytes, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::module::{Module, Param};
    use burn::nn::{Linear, LinearConfig};

    type TestBackend = NdArray<f32>;

    #[derive(Module, Debug)]
    struct Pair<B: Backend> {
        first: Linear<B>,
        second: Linear<B>,
    }

    impl<B: Backend> Checkpointable<B> for Pair<B> {
        type Record = PairRecord<B>;

        fn to_record(&self) -> Self::Record {
            self.clone().into_record()
        }

        fn load_record(self, record: Self::Record) -> Self {
            Module::load_record(self, record)
        }
    }

    fn pair(device: &<TestBackend as Backend>::Device) -> Pair<TestBackend> {
        Pair {
            first: LinearConfig::new(4, 3).init(device),
            second: LinearConfig::new(3, 2).init(device),
        }
    }

    fn weights(module: &Pair<TestBackend>) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        for linear in [&module.first, &module.second] {
            out.push(linear.weight.val().into_data().to_vec::<f32>().unwrap());
            let bias: &Param<Tensor<TestBackend, 1>> = linear.bias.as_ref().unwrap();
            out.push(bias.val().into_data().to_vec::<f32>().unwrap());
        }
        out
    }

    #[test]
    fn round_trip_restores_identical_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let store = CheckpointIo::new(dir.path().join("ckpt"), "nets");

        let saved = pair(&device);
        store.save::<TestBackend, _>(&saved, 7, 0).unwrap();
        assert!(dir.path().join("ckpt").join("nets:000007.ckpt").is_file());

        let fresh = pair(&device);
        assert_ne!(weights(&saved), weights(&fresh));
        let loaded = store.load::<TestBackend, _>(fresh, 7, &device).unwrap();
        assert_eq!(weights(&saved), weights(&loaded));
    }

    #[test]
    fn retention_removes_only_the_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let store = CheckpointIo::new(dir.path(), "optims");
        let state = pair(&device);

        store.save::<TestBackend, _>(&state, 5, 0).unwrap();
        store.save::<TestBackend, _>(&state, 10, 10).unwrap();
        store.save::<TestBackend, _>(&state, 20, 10).unwrap();

        assert!(!store.path(10).exists());
        assert!(store.path(20).exists());
        assert!(store.path(5).exists());
    }

    #[test]
    fn loading_an_absent_iteration_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let store = CheckpointIo::new(dir.path(), "nets_ema");

        let err = store
            .load::<TestBackend, _>(pair(&device), 3, &device)
            .unwrap_err();
        assert!(matches!(err, TrainError::MissingCheckpoint(path) if path == store.path(3)));
    }

    #[test]
    fn parses_canonical_names() {
        assert_eq!(
            CheckpointName::parse("gen:000200.ckpt"),
            Some(CheckpointName {
                name: "gen".to_string(),
                iteration: 200,
                file_name: "gen:000200.ckpt".to_string(),
            })
        );
        assert_eq!(checkpoint_file_name("nets_ema", 42), "nets_ema:000042.ckpt");

        let unpadded = CheckpointName::parse("gen:7.ckpt").unwrap();
        assert_eq!(unpadded.iteration, 7);
        assert_eq!(unpadded.file_name, "gen:7.ckpt");
    }

    #[test]
    fn rejects_malformed_names() {
        for name in ["gen.ckpt", "gen:abc.ckpt", ":000100.ckpt", "gen:.ckpt"] {
            assert_eq!(CheckpointName::parse(name), None, "{name}");
        }
    }

    #[test]
    fn listing_skips_malformed_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "gen:000100.ckpt",
            "gen:000300.ckpt",
            "gen:latest.ckpt",
            "generator:000900.ckpt",
            "disc:000500.ckpt",
            "gen:000700.json",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let found = list_checkpoints(dir.path(), "gen").unwrap();
        let iterations: Vec<_> = found.iter().map(|n| n.iteration).collect();
        assert_eq!(iterations, vec![100, 300]);

        let store = CheckpointIo::new(dir.path(), "gen");
        assert_eq!(store.latest_iteration().unwrap(), Some(300));
        assert_eq!(
            CheckpointIo::new(dir.path().join("missing"), "gen")
                .latest_iteration()
                .unwrap(),
            None
        );
    }
}
