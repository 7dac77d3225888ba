//! Controller options: a partial, mergeable form and the resolved form the
//! controller runs with.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};
use crate::restart::RestartPolicy;

/// Every field is optional so that options from several sources can be
/// layered with [`ControllerOptions::merge`]. Unknown keys are rejected.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerOptions {
    pub segments: Option<i64>,
    pub file: Option<PathBuf>,
    pub args: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub restart: RestartOptions,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RestartOptions {
    pub signal: Option<bool>,
    pub code: Option<bool>,
    pub normal: Option<bool>,
    /// Milliseconds.
    pub min_age: Option<u64>,
}

/// Resolved options.
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    pub segments: usize,
    pub launch: LaunchConfig,
    pub restart: RestartPolicy,
}

/// Everything needed to start one segment process.
#[derive(Clone, Debug, PartialEq)]
pub struct LaunchConfig {
    pub file: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the primary's own environment.
    pub env: BTreeMap<String, String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Per-launch adjustments passed to `Controller::launch`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaunchOverride {
    pub file: Option<PathBuf>,
    pub args: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

fn merge_env(
    base: Option<BTreeMap<String, String>>,
    overrides: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match (base, overrides) {
        (Some(mut base), Some(overrides)) => {
            base.extend(overrides);
            Some(base)
        }
        (base, None) => base,
        (None, overrides) => overrides,
    }
}

impl RestartOptions {
    pub fn merge(self, overrides: RestartOptions) -> RestartOptions {
        RestartOptions {
            signal: overrides.signal.or(self.signal),
            code: overrides.code.or(self.code),
            normal: overrides.normal.or(self.normal),
            min_age: overrides.min_age.or(self.min_age),
        }
    }

    pub fn resolve(&self) -> RestartPolicy {
        let defaults = RestartPolicy::default();
        RestartPolicy {
            on_signal: self.signal.unwrap_or(defaults.on_signal),
            on_error_exit: self.code.unwrap_or(defaults.on_error_exit),
            on_normal_exit: self.normal.unwrap_or(defaults.on_normal_exit),
            min_age: self
                .min_age
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_age),
        }
    }
}

impl ControllerOptions {
    /// Layer `overrides` on top of `self`. A field set in `overrides` wins;
    /// `env` maps are unioned with override keys winning; `restart` is merged
    /// field by field.
    pub fn merge(self, overrides: ControllerOptions) -> ControllerOptions {
        ControllerOptions {
            segments: overrides.segments.or(self.segments),
            file: overrides.file.or(self.file),
            args: overrides.args.or(self.args),
            env: merge_env(self.env, overrides.env),
            uid: overrides.uid.or(self.uid),
            gid: overrides.gid.or(self.gid),
            restart: self.restart.merge(overrides.restart),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| SupervisorError::InvalidConfig(err.to_string()))
    }

    pub fn load_toml(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            SupervisorError::InvalidConfig(format!("cannot read {}: {}", path.display(), err))
        })?;
        Self::from_toml_str(&contents).map_err(|err| match err {
            SupervisorError::InvalidConfig(msg) => {
                SupervisorError::InvalidConfig(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Apply defaults and validate.
    pub fn resolve(&self) -> Result<ControllerConfig> {
        let file = match &self.file {
            Some(file) if !file.as_os_str().is_empty() => file.clone(),
            _ => return Err(SupervisorError::MissingExecutable),
        };
        let file = if file.is_absolute() {
            file
        } else {
            env::current_dir()
                .map_err(|err| {
                    SupervisorError::InvalidConfig(format!(
                        "cannot resolve {} against the working directory: {}",
                        file.display(),
                        err
                    ))
                })?
                .join(file)
        };

        let segments = match self.segments {
            Some(count) if count <= 0 => return Err(SupervisorError::InvalidSegmentCount(count)),
            Some(count) => usize::try_from(count)
                .map_err(|_| SupervisorError::InvalidSegmentCount(count))?,
            None => default_segment_count(),
        };

        Ok(ControllerConfig {
            segments,
            launch: LaunchConfig {
                file,
                args: self.args.clone().unwrap_or_default(),
                env: self.env.clone().unwrap_or_default(),
                uid: Some(self.uid.unwrap_or_else(|| nix::unistd::geteuid().as_raw())),
                gid: Some(self.gid.unwrap_or_else(|| nix::unistd::getegid().as_raw())),
            },
            restart: self.restart.resolve(),
        })
    }
}

/// Two segments per available core.
pub fn default_segment_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

impl LaunchConfig {
    /// Same precedence as [`ControllerOptions::merge`].
    pub fn merged(&self, overrides: &LaunchOverride) -> LaunchConfig {
        let mut env = self.env.clone();
        if let Some(extra) = &overrides.env {
            env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        LaunchConfig {
            file: overrides.file.clone().unwrap_or_else(|| self.file.clone()),
            args: overrides.args.clone().unwrap_or_else(|| self.args.clone()),
            env,
            uid: overrides.uid.or(self.uid),
            gid: overrides.gid.or(self.gid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn merge_prefers_overrides_field_by_field() {
        let base = ControllerOptions {
            segments: Some(4),
            file: Some("/srv/worker".into()),
            args: Some(vec!["--base".into()]),
            env: env_of(&[("A", "1"), ("B", "base")]),
            restart: RestartOptions {
                signal: Some(false),
                min_age: Some(100),
                ..Default::default()
            },
            ..Default::default()
        };
        let overrides = ControllerOptions {
            segments: Some(2),
            env: env_of(&[("B", "override"), ("C", "3")]),
            restart: RestartOptions {
                min_age: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = base.merge(overrides);
        assert_eq!(merged.segments, Some(2));
        assert_eq!(merged.file, Some(PathBuf::from("/srv/worker")));
        assert_eq!(merged.args, Some(vec!["--base".to_string()]));
        assert_eq!(merged.env, env_of(&[("A", "1"), ("B", "override"), ("C", "3")]));
        assert_eq!(merged.restart.signal, Some(false));
        assert_eq!(merged.restart.min_age, Some(0));
    }

    #[test]
    fn resolve_applies_defaults() {
        let options = ControllerOptions {
            file: Some("/srv/worker".into()),
            ..Default::default()
        };
        let config = options.resolve().unwrap();

        assert_eq!(config.segments, default_segment_count());
        assert!(config.segments >= 2);
        assert!(config.launch.args.is_empty());
        assert!(config.launch.env.is_empty());
        assert_eq!(config.launch.uid, Some(nix::unistd::geteuid().as_raw()));
        assert_eq!(config.launch.gid, Some(nix::unistd::getegid().as_raw()));
        assert_eq!(config.restart, RestartPolicy::default());
    }

    #[test]
    fn relative_file_resolves_against_working_directory() {
        let options = ControllerOptions {
            file: Some("bin/worker".into()),
            segments: Some(1),
            ..Default::default()
        };
        let config = options.resolve().unwrap();

        assert!(config.launch.file.is_absolute());
        assert_eq!(
            config.launch.file,
            env::current_dir().unwrap().join("bin/worker")
        );
    }

    #[test]
    fn missing_or_empty_file_is_rejected() {
        assert!(matches!(
            ControllerOptions::default().resolve(),
            Err(SupervisorError::MissingExecutable)
        ));
        let empty = ControllerOptions {
            file: Some(PathBuf::new()),
            ..Default::default()
        };
        assert!(matches!(
            empty.resolve(),
            Err(SupervisorError::MissingExecutable)
        ));
    }

    #[test]
    fn non_positive_segment_count_is_rejected() {
        for count in [0, -3] {
            let options = ControllerOptions {
                file: Some("/srv/worker".into()),
                segments: Some(count),
                ..Default::default()
            };
            assert!(matches!(
                options.resolve(),
                Err(SupervisorError::InvalidSegmentCount(c)) if c == count
            ));
        }
    }

    #[test]
    fn toml_file_with_unknown_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "segments = 3\nfile = \"/srv/worker\"\n[restart]\nmin_age = 250").unwrap();
        let options = ControllerOptions::load_toml(file.path()).unwrap();
        assert_eq!(options.segments, Some(3));
        assert_eq!(options.restart.min_age, Some(250));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "segmentz = 3").unwrap();
        assert!(matches!(
            ControllerOptions::load_toml(bad.path()),
            Err(SupervisorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn launch_override_replaces_args_and_extends_env() {
        let base = ControllerOptions {
            file: Some("/srv/worker".into()),
            args: Some(vec!["a".into()]),
            env: env_of(&[("MODE", "base"), ("KEEP", "1")]),
            segments: Some(1),
            ..Default::default()
        }
        .resolve()
        .unwrap()
        .launch;

        let merged = base.merged(&LaunchOverride {
            args: Some(vec!["b".into(), "c".into()]),
            env: env_of(&[("MODE", "special")]),
            ..Default::default()
        });

        assert_eq!(merged.file, base.file);
        assert_eq!(merged.args, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(merged.env.get("MODE").map(String::as_str), Some("special"));
        assert_eq!(merged.env.get("KEEP").map(String::as_str), Some("1"));
        assert_eq!(merged.uid, base.uid);
    }
}
