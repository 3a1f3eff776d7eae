//! Persisting broadcast maps for postmortem.
//!
//! A dump is a safetensors file: tensor values are stored as tensors, every
//! other value goes as JSON into the header metadata under its own key.

use crate::{
    broadcast::BroadcastableModelInput, config::RunnerConfig, value::Value, Device, TensorDict,
};
use anyhow::{bail, Context, Result};
use safetensors::SafeTensors;
use std::{
    collections::HashMap as StdHashMap,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

const FORMAT_KEY: &str = "__rllm_runner__";
const FORMAT: &str = "tensor_dict/1";

pub fn save_tensor_dict(tensor_dict: &TensorDict, filename: &Path) -> Result<()> {
    let mut tensors = Vec::new();
    let mut metadata = StdHashMap::new();
    metadata.insert(FORMAT_KEY.to_string(), FORMAT.to_string());
    for (k, v) in tensor_dict.iter() {
        match v {
            Value::Tensor(t) => tensors.push((k, t)),
            other => {
                metadata.insert(k.to_string(), serde_json::to_string(other)?);
            }
        }
    }
    safetensors::serialize_to_file(tensors, &Some(metadata), filename)
        .with_context(|| format!("can't write {}", filename.display()))?;
    Ok(())
}

/// Tensors come back on the CPU.
pub fn load_tensor_dict(filename: &Path) -> Result<TensorDict> {
    let content =
        std::fs::read(filename).with_context(|| format!("can't read {}", filename.display()))?;
    let (_, header) = SafeTensors::read_metadata(&content)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    if metadata.get(FORMAT_KEY).map(|s| s.as_str()) != Some(FORMAT) {
        bail!("{} is not a tensor dict dump", filename.display());
    }

    let mut r = TensorDict::new();
    for (k, v) in metadata.iter() {
        if k != FORMAT_KEY {
            let value: Value = serde_json::from_str(v)
                .with_context(|| format!("bad value for '{}' in {}", k, filename.display()))?;
            r.insert(k.as_str(), value);
        }
    }

    for (name, tensor) in candle_core::safetensors::load_buffer(&content, &Device::Cpu)? {
        r.insert(name, tensor);
    }
    Ok(r)
}

fn dump_filename(dump_dir: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    dump_dir.join(format!("err_execute_model_input_{}.safetensors", millis))
}

/// Run `f`; if it fails, save the broadcastable form of `model_input` next to
/// the error so the step can be replayed.
pub fn dump_input_when_error<I, T, F>(model_input: &I, config: &RunnerConfig, f: F) -> Result<T>
where
    I: BroadcastableModelInput,
    F: FnOnce() -> Result<T>,
{
    let err = match f() {
        Ok(r) => return Ok(r),
        Err(e) => e,
    };
    if !config.dump_input_on_error {
        return Err(err);
    }

    let filename = dump_filename(&config.dump_dir);
    match save_tensor_dict(&model_input.as_broadcastable_tensor_dict(), &filename) {
        Ok(()) => {
            log::warn!("model input dumped to {}", filename.display());
            Err(err.context(format!(
                "Error in model execution (input dumped to {})",
                filename.display()
            )))
        }
        Err(e) => {
            log::warn!("failed to dump model input: {e:?}");
            Err(err.context("Error in model execution"))
        }
    }
}
