//! Locating the checkpoint files, either in a local directory or through the
//! Hugging Face hub cache.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use candle::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::api::RepoInfo;
use hf_hub::{Repo, RepoType};
use serde::Deserialize;

use crate::{Error, Result};

const SINGLE_WEIGHTS: &str = "model.safetensors";
const WEIGHTS_INDEX: &str = "model.safetensors.index.json";

enum Source {
    Local(PathBuf),
    Hub { repo_id: String, repo: ApiRepo },
}

impl Source {
    fn open(model_id_or_path: &str, revision: &str) -> Result<Self> {
        let path = Path::new(model_id_or_path);
        if path.exists() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        let api = Api::new().map_err(|source| Error::Hub {
            repo: model_id_or_path.to_string(),
            source,
        })?;
        let repo = api.repo(Repo::with_revision(
            model_id_or_path.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));
        Ok(Self::Hub {
            repo_id: model_id_or_path.to_string(),
            repo,
        })
    }

    fn required(&self, name: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(name);
                if !path.exists() {
                    crate::bail!("missing {name} in {dir:?}");
                }
                Ok(path)
            }
            Self::Hub { repo_id, repo } => repo.get(name).map_err(|source| Error::Hub {
                repo: format!("{repo_id}/{name}"),
                source,
            }),
        }
    }

    fn optional(&self, name: &str) -> Option<PathBuf> {
        match self {
            Self::Local(dir) => Some(dir.join(name)).filter(|p| p.exists()),
            Self::Hub { repo_id, repo } => match repo.get(name) {
                Ok(path) => Some(path),
                Err(err) => {
                    let info = repo.info().ok();
                    if missing_from_listing(info.as_ref(), name) {
                        tracing::debug!(file = name, "optional file not in the repo");
                    } else {
                        tracing::warn!(
                            repo = repo_id,
                            file = name,
                            error = %err,
                            "failed to fetch optional file, continuing without it"
                        );
                    }
                    None
                }
            },
        }
    }
}

/// True only when the repo listing is known and does not contain `name`.
fn missing_from_listing(info: Option<&RepoInfo>, name: &str) -> bool {
    info.is_some_and(|info| info.siblings.iter().all(|s| s.rfilename != name))
}

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: serde_json::Map<String, serde_json::Value>,
}

/// Shard file names referenced by a `model.safetensors.index.json`, sorted
/// and deduplicated.
fn shard_filenames_from_index(index_path: &Path) -> Result<Vec<String>> {
    let data = std::fs::read_to_string(index_path).map_err(Error::io(index_path))?;
    let idx: SafetensorsIndex = serde_json::from_str(&data).map_err(Error::json(index_path))?;
    let mut shards = BTreeSet::new();
    for (param, filename) in idx.weight_map {
        match filename.as_str() {
            Some(f) if !f.trim().is_empty() => {
                shards.insert(f.to_string());
            }
            _ => crate::bail!("bad shard file name for {param:?} in {index_path:?}"),
        }
    }
    if shards.is_empty() {
        crate::bail!("no shards listed in {index_path:?}");
    }
    Ok(shards.into_iter().collect())
}

/// Every file a generation run reads from a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub chat_template: Option<PathBuf>,
    pub preprocessor_config: Option<PathBuf>,
    pub generation_config: Option<PathBuf>,
}

impl ModelFiles {
    /// Resolves `model_id_or_path`: an existing directory is used as is,
    /// anything else is treated as a hub repo id at `revision`.
    pub fn resolve(model_id_or_path: &str, revision: &str) -> Result<Self> {
        Self::resolve_with_tokenizer(model_id_or_path, revision, None)
    }

    /// Same as [`ModelFiles::resolve`] with an optional `tokenizer.json`
    /// override, in which case the checkpoint's own one is not fetched.
    pub fn resolve_with_tokenizer(
        model_id_or_path: &str,
        revision: &str,
        tokenizer: Option<PathBuf>,
    ) -> Result<Self> {
        let source = Source::open(model_id_or_path, revision)?;
        let config = source.required("config.json")?;
        let weights = match source.optional(SINGLE_WEIGHTS) {
            Some(single) => vec![single],
            None => {
                let index = source.required(WEIGHTS_INDEX)?;
                shard_filenames_from_index(&index)?
                    .iter()
                    .map(|name| source.required(name))
                    .collect::<Result<Vec<_>>>()?
            }
        };
        let tokenizer = match tokenizer {
            Some(path) => path,
            None => source.required("tokenizer.json")?,
        };
        let files = Self {
            config,
            weights,
            tokenizer,
            tokenizer_config: source.optional("tokenizer_config.json"),
            chat_template: source.optional("chat_template.json"),
            preprocessor_config: source.optional("preprocessor_config.json"),
            generation_config: source.optional("generation_config.json"),
        };
        tracing::debug!(?files, "resolved model files");
        Ok(files)
    }

    /// Memory maps the safetensors shards.
    pub fn var_builder(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        // SAFETY: the shards are not expected to be modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&self.weights, dtype, device)? };
        Ok(vb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_tmp_dir(prefix: &str) -> anyhow::Result<PathBuf> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let dir = std::env::temp_dir().join(format!("{prefix}_{}", now.as_nanos()));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn touch(dir: &Path, names: &[&str]) -> anyhow::Result<()> {
        for name in names {
            fs::write(dir.join(name), [])?;
        }
        Ok(())
    }

    #[test]
    fn shard_index_is_deduplicated_and_sorted() -> anyhow::Result<()> {
        let dir = unique_tmp_dir("qwen2_audio_shard_index")?;
        let index_path = dir.join(WEIGHTS_INDEX);
        let index = serde_json::json!({
            "metadata": { "total_size": 16 },
            "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }
        });
        fs::write(&index_path, index.to_string())?;
        assert_eq!(
            shard_filenames_from_index(&index_path)?,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn local_single_file_checkpoint() -> anyhow::Result<()> {
        let dir = unique_tmp_dir("qwen2_audio_single")?;
        touch(
            &dir,
            &["config.json", SINGLE_WEIGHTS, "tokenizer.json", "preprocessor_config.json"],
        )?;
        let files = ModelFiles::resolve(&dir.to_string_lossy(), "main")?;
        assert_eq!(files.config, dir.join("config.json"));
        assert_eq!(files.weights, vec![dir.join(SINGLE_WEIGHTS)]);
        assert_eq!(files.tokenizer, dir.join("tokenizer.json"));
        assert_eq!(
            files.preprocessor_config,
            Some(dir.join("preprocessor_config.json"))
        );
        assert_eq!(files.generation_config, None);
        assert_eq!(files.chat_template, None);
        Ok(())
    }

    #[test]
    fn local_sharded_checkpoint() -> anyhow::Result<()> {
        let dir = unique_tmp_dir("qwen2_audio_sharded")?;
        let index = serde_json::json!({
            "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors"
            }
        });
        fs::write(dir.join(WEIGHTS_INDEX), index.to_string())?;
        touch(
            &dir,
            &[
                "config.json",
                "tokenizer.json",
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors",
            ],
        )?;
        let files = ModelFiles::resolve(&dir.to_string_lossy(), "main")?;
        assert_eq!(
            files.weights,
            vec![
                dir.join("model-00001-of-00002.safetensors"),
                dir.join("model-00002-of-00002.safetensors"),
            ]
        );
        Ok(())
    }

    #[test]
    fn only_unlisted_files_count_as_missing() {
        let info = RepoInfo {
            siblings: ["config.json", "tokenizer.json"]
                .into_iter()
                .map(|name| hf_hub::api::Siblings {
                    rfilename: name.to_string(),
                })
                .collect(),
            sha: "0123abcd".to_string(),
        };
        assert!(missing_from_listing(Some(&info), "generation_config.json"));
        // Listed but not fetched, or no listing at all: a real failure.
        assert!(!missing_from_listing(Some(&info), "tokenizer.json"));
        assert!(!missing_from_listing(None, "generation_config.json"));
    }

    #[test]
    fn missing_files_are_reported() -> anyhow::Result<()> {
        let dir = unique_tmp_dir("qwen2_audio_missing")?;
        touch(&dir, &["config.json", SINGLE_WEIGHTS])?;
        assert!(ModelFiles::resolve(&dir.to_string_lossy(), "main").is_err());

        let tokenizer = dir.join("custom-tokenizer.json");
        let files = ModelFiles::resolve_with_tokenizer(
            &dir.to_string_lossy(),
            "main",
            Some(tokenizer.clone()),
        )?;
        assert_eq!(files.tokenizer, tokenizer);
        Ok(())
    }
}
