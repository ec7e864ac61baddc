//! Resuming standalone models from the newest file saved under their name.
//!
//! Models are stored as `{dir}/{name}:{iteration:06}.ckpt`, one file per save.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use tracing::info;

use crate::checkpoint::{
    CheckpointName, checkpoint_file_name, decode_record, encode_record, list_checkpoints,
};
use crate::error::{Result, TrainError};

/// Sub-directory of the save directory that holds model files.
pub const MODEL_DIR: &str = "model";

/// Whether `dir` holds at least one entry. A missing directory holds none.
pub fn has_models(dir: &Path) -> Result<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Newest saved file for `name` in `dir`.
pub fn latest_model(name: &str, dir: &Path) -> Result<CheckpointName> {
    list_checkpoints(dir, name)?
        .into_iter()
        .max_by_key(|candidate| candidate.iteration)
        .ok_or_else(|| TrainError::NoMatchingModel {
            name: name.to_string(),
            dir: dir.to_path_buf(),
        })
}

/// Reload every model from its newest file, or return them untouched.
///
/// Nothing is loaded when `reload` is off or `model_path` is empty. Files are looked up in
/// `save_dir/model`.
pub fn initialize<B: Backend, M: Module<B>>(
    models: BTreeMap<String, M>,
    reload: bool,
    save_dir: &Path,
    model_path: &Path,
    device: &B::Device,
) -> Result<BTreeMap<String, M>> {
    if !reload || !has_models(model_path)? {
        info!("Initializing models from scratch");
        return Ok(models);
    }

    let dir = save_dir.join(MODEL_DIR);
    models
        .into_iter()
        .map(|(name, model)| {
            let model = load_last_model(model, &name, &dir, device)?;
            Ok((name, model))
        })
        .collect()
}

/// Iteration at which counting resumes: one past the newest saved file of `name`.
pub fn infer_iteration(
    name: &str,
    reload: bool,
    model_path: &Path,
    save_dir: &Path,
) -> Result<usize> {
    if !reload || !has_models(model_path)? {
        return Ok(0);
    }
    Ok(latest_model(name, &save_dir.join(MODEL_DIR))?.iteration + 1)
}

/// Load the newest file saved for `name` in `dir` into `model`.
pub fn load_last_model<B: Backend, M: Module<B>>(
    model: M,
    name: &str,
    dir: &Path,
    device: &B::Device,
) -> Result<M> {
    let latest = latest_model(name, dir)?;
    let path = dir.join(&latest.file_name);
    info!("Loading {name} from {}", path.display());
    load_model(model, &path, device)
}

/// Load a model file written by [`save_model`] onto `device`.
pub fn load_model<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> Result<M> {
    if !path.is_file() {
        return Err(TrainError::MissingCheckpoint(path.to_path_buf()));
    }
    let record = decode_record::<B, M::Record>(fs::read(path)?, device)?;
    Ok(model.load_record(record))
}

/// Write `model` as `{dir}/{name}:{iteration:06}.ckpt`.
pub fn save_model<B: Backend, M: Module<B>>(
    model: &M,
    name: &str,
    dir: &Path,
    iteration: usize,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(checkpoint_file_name(name, iteration));
    fs::write(&path, encode_record::<B, _>(model.clone().into_record())?)?;
    Ok(path)
}
