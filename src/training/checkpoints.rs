//! Checkpoints: one safetensors file per network plus JSON metadata
//!
//! Layout of a checkpoint directory `{tag}-{step:08}`:
//! `mixer.safetensors`, `generator-{layer}.safetensors` for every target
//! layer, `discriminator.safetensors` when a regulariser is trained, and
//! `metadata.json`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::hypernetwork::HyperNetwork;

const METADATA_FILE: &str = "metadata.json";
const MIXER_FILE: &str = "mixer.safetensors";
const DISCRIMINATOR_FILE: &str = "discriminator.safetensors";

/// Everything needed to interpret and resume from a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMetadata {
    pub step: usize,
    pub epoch: usize,
    /// Batches of `epoch` already trained when the checkpoint was taken
    #[serde(default)]
    pub batch_in_epoch: usize,
    /// Test accuracy at save time, if an evaluation had run
    pub accuracy: Option<f64>,
    /// Test loss at save time, if an evaluation had run
    pub loss: Option<f64>,
    pub created_at: DateTime<Utc>,
    /// Generated layer names in generator order
    pub layers: Vec<String>,
    pub has_discriminator: bool,
    pub config: Config,
}

impl CheckpointMetadata {
    pub fn new(step: usize, epoch: usize, network: &HyperNetwork, config: &Config) -> Self {
        Self {
            step,
            epoch,
            batch_in_epoch: 0,
            accuracy: None,
            loss: None,
            created_at: Utc::now(),
            layers: network.generator_names(),
            has_discriminator: false,
            config: config.clone(),
        }
    }

    pub fn with_batch_offset(mut self, batch_in_epoch: usize) -> Self {
        self.batch_in_epoch = batch_in_epoch;
        self
    }

    pub fn with_eval(mut self, accuracy: f64, loss: f64) -> Self {
        self.accuracy = Some(accuracy);
        self.loss = Some(loss);
        self
    }

    /// Read `metadata.json` from a checkpoint directory
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let content = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }
}

/// A checkpoint found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    pub tag: String,
    pub step: usize,
}

/// Writes, prunes, lists and restores checkpoints under one directory
pub struct CheckpointManager {
    dir: PathBuf,
    keep_last: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl AsRef<Path>, keep_last: usize) -> Result<Self> {
        if keep_last == 0 {
            bail!("keep_last must be greater than 0");
        }
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self { dir, keep_last })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save every network and the metadata; returns the checkpoint directory
    #[instrument(skip(self, network, discriminator, metadata), fields(step = metadata.step))]
    pub fn save(
        &self,
        tag: &str,
        network: &HyperNetwork,
        discriminator: Option<&VarMap>,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        if tag.is_empty() || tag.contains(std::path::MAIN_SEPARATOR) {
            bail!("invalid checkpoint tag '{}'", tag);
        }
        let path = self.dir.join(format!("{}-{:08}", tag, metadata.step));
        std::fs::create_dir_all(&path).with_context(|| format!("creating {}", path.display()))?;

        network
            .mixer_vars()
            .save(path.join(MIXER_FILE))
            .context("saving mixer")?;
        for (name, vars) in network.generator_names().iter().zip(network.generator_vars()) {
            vars.save(path.join(generator_file(name)))
                .with_context(|| format!("saving generator '{}'", name))?;
        }
        if let Some(vars) = discriminator {
            vars.save(path.join(DISCRIMINATOR_FILE)).context("saving discriminator")?;
        }

        let mut metadata = metadata.clone();
        metadata.has_discriminator = discriminator.is_some();
        metadata.layers = network.generator_names();
        std::fs::write(path.join(METADATA_FILE), serde_json::to_string_pretty(&metadata)?)?;

        info!("Saved checkpoint {}", path.display());
        self.prune()?;
        Ok(path)
    }

    /// Restore variables in place after checking every file matches the networks
    #[instrument(skip(self, network, discriminator))]
    pub fn load(
        &self,
        path: &Path,
        network: &HyperNetwork,
        discriminator: Option<&VarMap>,
    ) -> Result<CheckpointMetadata> {
        let metadata = CheckpointMetadata::read(path)?;
        let names = network.generator_names();
        if metadata.layers != names {
            bail!(
                "checkpoint layers {:?} do not match network layers {:?}",
                metadata.layers,
                names
            );
        }

        let mut files: Vec<(PathBuf, &VarMap)> = vec![(path.join(MIXER_FILE), network.mixer_vars())];
        for (name, vars) in names.iter().zip(network.generator_vars()) {
            files.push((path.join(generator_file(name)), vars));
        }
        match (discriminator, metadata.has_discriminator) {
            (Some(vars), true) => files.push((path.join(DISCRIMINATOR_FILE), vars)),
            (Some(_), false) => warn!("Checkpoint has no discriminator; keeping its fresh weights"),
            _ => {}
        }

        // verify everything before touching any variable
        for (file, vars) in &files {
            verify_tensor_names(file, vars)?;
        }
        for (file, vars) in files {
            let mut vars = vars.clone();
            vars.load(&file).with_context(|| format!("loading {}", file.display()))?;
        }

        info!("Restored checkpoint {} (step {})", path.display(), metadata.step);
        Ok(metadata)
    }

    /// Checkpoints in this directory ordered by step
    pub fn list(&self) -> Result<Vec<CheckpointInfo>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_dir() || !path.join(METADATA_FILE).exists() {
                continue;
            }
            let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((tag, step)) = dir_name.rsplit_once('-') else {
                continue;
            };
            if let Ok(step) = step.parse::<usize>() {
                found.push(CheckpointInfo {
                    tag: tag.to_string(),
                    step,
                    path: path.clone(),
                });
            }
        }
        found.sort_by_key(|info| info.step);
        Ok(found)
    }

    pub fn latest(&self) -> Result<Option<CheckpointInfo>> {
        Ok(self.list()?.pop())
    }

    fn prune(&self) -> Result<()> {
        let checkpoints = self.list()?;
        if checkpoints.len() <= self.keep_last {
            return Ok(());
        }
        let excess = checkpoints.len() - self.keep_last;
        for old in checkpoints.into_iter().take(excess) {
            debug!("Removing old checkpoint {}", old.path.display());
            std::fs::remove_dir_all(&old.path).with_context(|| format!("removing {}", old.path.display()))?;
        }
        Ok(())
    }
}

fn generator_file(layer: &str) -> String {
    format!("generator-{}.safetensors", layer)
}

/// Compare the tensor names stored in `file` with the variables of `vars`
fn verify_tensor_names(file: &Path, vars: &VarMap) -> Result<()> {
    if !file.exists() {
        bail!("checkpoint file {} is missing", file.display());
    }
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| anyhow!("invalid safetensors file {}: {}", file.display(), e))?;
    let stored: BTreeSet<String> = tensors.names().into_iter().cloned().collect();
    let expected: BTreeSet<String> = vars
        .data()
        .lock()
        .map_err(|_| anyhow!("variable map lock poisoned"))?
        .keys()
        .cloned()
        .collect();

    if stored != expected {
        let missing: Vec<_> = expected.difference(&stored).collect();
        let unexpected: Vec<_> = stored.difference(&expected).collect();
        bail!(
            "{} does not match the network: missing {:?}, unexpected {:?}",
            file.display(),
            missing,
            unexpected
        );
    }
    Ok(())
}
