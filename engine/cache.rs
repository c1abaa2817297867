//! # Result Cache
//!
//! Persists fitted results as TOML artifacts under a root directory. The caller
//! chooses the slot (a relative path); the key also records the model variant,
//! the model configuration and the inference method, and a stored artifact only
//! answers a lookup for the exact key it was written under.
//!
//! Loading never fails: an absent artifact is a miss, and an unreadable or
//! malformed one is reported as a [`CacheCorruptionError`] diagnostic and treated
//! as a miss. Stores go through a temporary file and a rename, so an interrupted
//! store never leaves a partial artifact in place.

use crate::config::{ModelConfig, ModelVariant};
use crate::inference::{FittedResult, InferenceMethod};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bumped whenever the artifact layout changes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheKey {
    /// Caller-chosen location relative to the cache root.
    pub slot: PathBuf,
    pub variant: ModelVariant,
    pub model_config: ModelConfig,
    pub method: InferenceMethod,
}

impl CacheKey {
    pub fn new(slot: impl Into<PathBuf>, config: &ModelConfig, method: InferenceMethod) -> Self {
        Self {
            slot: slot.into(),
            variant: config.resolved_variant(),
            model_config: config.clone(),
            method,
        }
    }
}

/// Why a stored artifact could not be used.
#[derive(Error, Debug)]
pub enum CacheCorruptionError {
    #[error("CacheCorruptionError: failed to read '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CacheCorruptionError: '{path}' is not a valid result artifact: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("CacheCorruptionError: '{path}' has format version {found}, expected {expected}")]
    VersionMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("CacheCorruptionError: '{path}' was stored under a different model or method")]
    KeyMismatch { path: PathBuf },
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to write cache artifact: {0}")]
    IoError(#[from] io::Error),
    #[error("Failed to serialize fitted result to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

#[derive(Debug)]
pub enum CacheLookup {
    Hit(Box<FittedResult>),
    Absent,
    Corrupt(CacheCorruptionError),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn into_result(self) -> Option<FittedResult> {
        match self {
            CacheLookup::Hit(result) => Some(*result),
            CacheLookup::Absent | CacheLookup::Corrupt(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Artifact {
    format_version: u32,
    key: CacheKey,
    result: FittedResult,
}

#[derive(Deserialize)]
struct VersionHeader {
    format_version: u32,
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    root: PathBuf,
}

impl ResultCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Artifact location for `key`; `.toml` is appended when the slot has no
    /// extension.
    pub fn artifact_path(&self, key: &CacheKey) -> PathBuf {
        let path = self.root.join(&key.slot);
        if path.extension().is_some() {
            path
        } else {
            path.with_extension("toml")
        }
    }

    pub fn load(&self, key: &CacheKey) -> CacheLookup {
        let path = self.artifact_path(key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("No cached result at {}", path.display());
                return CacheLookup::Absent;
            }
            Err(source) => return corrupt(CacheCorruptionError::Unreadable { path, source }),
        };

        let artifact: Artifact = match toml::from_str(&text) {
            Ok(artifact) => artifact,
            Err(source) => {
                return match toml::from_str::<VersionHeader>(&text) {
                    Ok(header) if header.format_version != FORMAT_VERSION => {
                        corrupt(CacheCorruptionError::VersionMismatch {
                            path,
                            found: header.format_version,
                            expected: FORMAT_VERSION,
                        })
                    }
                    _ => corrupt(CacheCorruptionError::Parse { path, source }),
                };
            }
        };

        if artifact.format_version != FORMAT_VERSION {
            return corrupt(CacheCorruptionError::VersionMismatch {
                path,
                found: artifact.format_version,
                expected: FORMAT_VERSION,
            });
        }
        if artifact.key != *key {
            return corrupt(CacheCorruptionError::KeyMismatch { path });
        }

        log::info!("Loaded cached {:?} result from {}", key.method, path.display());
        CacheLookup::Hit(Box::new(artifact.result))
    }

    /// Writes `result` for `key`, replacing any previous artifact.
    pub fn store(&self, key: &CacheKey, result: &FittedResult) -> Result<PathBuf, CacheError> {
        let path = self.artifact_path(key);
        let artifact = Artifact {
            format_version: FORMAT_VERSION,
            key: key.clone(),
            result: result.clone(),
        };
        let toml_string = toml::to_string_pretty(&artifact)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        {
            let mut file = BufWriter::new(fs::File::create(&tmp_path)?);
            file.write_all(toml_string.as_bytes())?;
            file.flush()?;
        }
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        log::info!("Stored {:?} result at {}", key.method, path.display());
        Ok(path)
    }
}

fn corrupt(error: CacheCorruptionError) -> CacheLookup {
    log::warn!("{error}; treating as a cache miss");
    CacheLookup::Corrupt(error)
}
