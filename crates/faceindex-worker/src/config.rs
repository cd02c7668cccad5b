use crate::runtime::{ModelPaths, RuntimeConfig};
use faceindex_core::ExecutionProviderPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_DETECTION_MODEL: &str = "yolov5s_face_640_640_dynamic.onnx";
const DEFAULT_EMBEDDING_MODEL: &str = "mobilefacenet_opset15.onnx";
const DEFAULT_AUXILIARY_MODEL: &str = "mobileclip_s2_image.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Optional settings read from the TOML file named by `FACEINDEX_CONFIG`.
///
/// Environment variables override anything set here.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub model_dir: Option<PathBuf>,
    pub face_detection_model: Option<String>,
    pub face_embedding_model: Option<String>,
    pub auxiliary_model: Option<String>,
    pub prefer_coreml: Option<bool>,
    pub prefer_nnapi: Option<bool>,
    pub prefer_xnnpack: Option<bool>,
    pub allow_cpu_fallback: Option<bool>,
    pub queue_depth: Option<usize>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Directory holding the default model files.
    pub model_dir: PathBuf,
    /// Model paths and provider preferences used when a request omits them.
    pub runtime: RuntimeConfig,
    /// Pending requests the worker queue holds before callers wait.
    pub queue_depth: usize,
}

impl Config {
    /// Load configuration from `FACEINDEX_*` environment variables, layered
    /// over the optional TOML file named by `FACEINDEX_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match std::env::var("FACEINDEX_CONFIG") {
            Ok(path) => FileConfig::from_path(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    /// Resolve settings from a file layer and an environment lookup.
    pub fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = env("FACEINDEX_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| default_model_dir(&env));

        let model_path = |key: &str, from_file: Option<String>, default: &str| {
            env(key).or(from_file).unwrap_or_else(|| {
                model_dir.join(default).to_string_lossy().into_owned()
            })
        };
        let model_paths = ModelPaths {
            face_detection: model_path(
                "FACEINDEX_DETECTION_MODEL",
                file.face_detection_model,
                DEFAULT_DETECTION_MODEL,
            ),
            face_embedding: model_path(
                "FACEINDEX_EMBEDDING_MODEL",
                file.face_embedding_model,
                DEFAULT_EMBEDDING_MODEL,
            ),
            auxiliary: model_path(
                "FACEINDEX_AUXILIARY_MODEL",
                file.auxiliary_model,
                DEFAULT_AUXILIARY_MODEL,
            ),
        };

        let defaults = ExecutionProviderPolicy::default();
        let flag = |key: &str, from_file: Option<bool>, default: bool| {
            env_bool(env(key)).or(from_file).unwrap_or(default)
        };
        let provider_policy = ExecutionProviderPolicy {
            prefer_coreml: flag("FACEINDEX_PREFER_COREML", file.prefer_coreml, defaults.prefer_coreml),
            prefer_nnapi: flag("FACEINDEX_PREFER_NNAPI", file.prefer_nnapi, defaults.prefer_nnapi),
            prefer_xnnpack: flag(
                "FACEINDEX_PREFER_XNNPACK",
                file.prefer_xnnpack,
                defaults.prefer_xnnpack,
            ),
            allow_cpu_fallback: flag(
                "FACEINDEX_ALLOW_CPU_FALLBACK",
                file.allow_cpu_fallback,
                defaults.allow_cpu_fallback,
            ),
        };

        let queue_depth = env("FACEINDEX_QUEUE_DEPTH")
            .and_then(|v| v.parse().ok())
            .or(file.queue_depth)
            .unwrap_or(16)
            .max(1);

        Self {
            model_dir,
            runtime: RuntimeConfig {
                model_paths,
                provider_policy,
            },
            queue_depth,
        }
    }
}

fn default_model_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceindex/models")
}

/// `"0"` and `"false"` disable, anything else enables.
fn env_bool(value: Option<String>) -> Option<bool> {
    value.map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "False"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(FileConfig::default(), lookup(&[("HOME", "/home/u")]));
        assert_eq!(config.model_dir, PathBuf::from("/home/u/.local/share/faceindex/models"));
        assert_eq!(
            config.runtime.model_paths.face_embedding,
            "/home/u/.local/share/faceindex/models/mobilefacenet_opset15.onnx"
        );
        assert_eq!(config.runtime.provider_policy, ExecutionProviderPolicy::default());
        assert_eq!(config.queue_depth, 16);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = FileConfig {
            model_dir: Some(PathBuf::from("/file/models")),
            face_detection_model: Some("/file/det.onnx".into()),
            prefer_xnnpack: Some(true),
            queue_depth: Some(4),
            ..Default::default()
        };
        let env = lookup(&[
            ("FACEINDEX_DETECTION_MODEL", "/env/det.onnx"),
            ("FACEINDEX_PREFER_XNNPACK", "0"),
        ]);
        let config = Config::from_sources(file, env);
        assert_eq!(config.runtime.model_paths.face_detection, "/env/det.onnx");
        assert_eq!(
            config.runtime.model_paths.auxiliary,
            "/file/models/mobileclip_s2_image.onnx"
        );
        assert!(!config.runtime.provider_policy.prefer_xnnpack);
        assert_eq!(config.queue_depth, 4);
    }

    #[test]
    fn test_parse_toml_file() {
        let file: FileConfig = toml::from_str(
            r#"
            model_dir = "/opt/models"
            allow_cpu_fallback = false
            "#,
        )
        .unwrap();
        let config = Config::from_sources(file, lookup(&[]));
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert!(!config.runtime.provider_policy.allow_cpu_fallback);
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(toml::from_str::<FileConfig>("camera = \"/dev/video0\"").is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let err = FileConfig::from_path(Path::new("/nonexistent/faceindex.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_queue_depth_at_least_one() {
        let config = Config::from_sources(FileConfig::default(), lookup(&[("FACEINDEX_QUEUE_DEPTH", "0")]));
        assert_eq!(config.queue_depth, 1);
    }
}
