// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for stackfix.
//!
//! Configuration is resolved once at startup into a [`StackfixConfig`], which is then passed to
//! the registry, fixtures and coordinator. Settings come from, in increasing priority:
//!
//! 1. the defaults embedded from `default-config.toml`
//! 2. the project config file, `.config/stackfix.toml` (or an explicit path)
//! 3. environment variables (`STACKFIX_REPLAY`)

use crate::{
    errors::{ConfigError, InvalidTeardownPolicy},
    lock::LockOptions,
    provision::{DEFAULT_BINARY_NAME, find_binary},
};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::{collections::BTreeSet, env, fmt, fs, io, time::Duration};
use tracing::{debug, warn};

/// The project config file, relative to the project root.
pub const CONFIG_PATH: &str = ".config/stackfix.toml";

/// Special value for `--config` that skips loading the project config.
pub const CONFIG_NONE: &str = "none";

/// Set to `1` to force replay mode.
pub const REPLAY_ENV: &str = "STACKFIX_REPLAY";

/// What to do with a shared resource once it's no longer needed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum TeardownPolicy {
    /// Destroy the resource; a failure to destroy is an error.
    #[default]
    On,

    /// Never destroy the resource. It's left for manual cleanup.
    Off,

    /// Destroy the resource, logging (but otherwise ignoring) failures.
    Ignore,
}

impl TeardownPolicy {
    /// Parses a teardown option case-insensitively.
    ///
    /// Returns `Ok(None)` for `default`, meaning "use the configured default".
    pub fn parse_option(input: &str) -> Result<Option<Self>, InvalidTeardownPolicy> {
        match input.to_ascii_lowercase().as_str() {
            "on" => Ok(Some(Self::On)),
            "off" => Ok(Some(Self::Off)),
            "ignore" => Ok(Some(Self::Ignore)),
            "default" => Ok(None),
            _ => Err(InvalidTeardownPolicy::new(input)),
        }
    }

    /// Resolves an optional per-fixture teardown option against the configured default.
    pub fn resolve(option: Option<&str>, default: Self) -> Result<Self, InvalidTeardownPolicy> {
        match option {
            Some(option) => Ok(Self::parse_option(option)?.unwrap_or(default)),
            None => Ok(default),
        }
    }

    /// Interprets a configured default. `default` and unrecognized values fall back to
    /// [`TeardownPolicy::On`].
    pub fn lenient_default(input: &str) -> Self {
        match Self::parse_option(input) {
            Ok(Some(policy)) => policy,
            Ok(None) => Self::On,
            Err(error) => {
                warn!("{error}, using `on` as the default teardown policy");
                Self::On
            }
        }
    }

    /// Returns the option string for this policy.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for TeardownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specifies where to load the project config from.
#[derive(Clone, Copy, Debug)]
pub enum ConfigLocation<'a> {
    /// `.config/stackfix.toml` under the project root, if it exists.
    Default,

    /// Skip the project config, using only built-in defaults.
    Isolated,

    /// An explicit path. It's an error if the file doesn't exist.
    Explicit(&'a Utf8Path),
}

impl<'a> ConfigLocation<'a> {
    /// Creates a location from a CLI value: `Default` for `None`, `Isolated` for `"none"`.
    pub fn from_cli(s: Option<&'a str>) -> Self {
        match s {
            None => Self::Default,
            Some(CONFIG_NONE) => Self::Isolated,
            Some(s) => Self::Explicit(Utf8Path::new(s)),
        }
    }
}

/// Resolved configuration, constructed once and shared by reference.
#[derive(Clone, Debug)]
pub struct StackfixConfig {
    teardown: TeardownPolicy,
    lock: LockOptions,
    module_dir: Option<Utf8PathBuf>,
    plugin_cache_dir: Option<Utf8PathBuf>,
    binary: Option<Utf8PathBuf>,
    replay: bool,
}

impl StackfixConfig {
    /// Loads configuration for the project at `root`.
    ///
    /// Creates the plugin cache directory, and fails if no provisioning binary can be found
    /// while replay mode is off.
    pub fn load(root: &Utf8Path, location: ConfigLocation<'_>) -> Result<Self, ConfigError> {
        let env_replay = env::var(REPLAY_ENV).is_ok_and(|v| v == "1");
        Self::load_with(
            root,
            location,
            &mut DefaultConfigWarnings,
            env_replay,
            find_binary,
        )
    }

    fn load_with(
        root: &Utf8Path,
        location: ConfigLocation<'_>,
        warnings: &mut impl ConfigWarnings,
        env_replay: bool,
        lookup_binary: impl FnOnce(&str) -> Option<Utf8PathBuf>,
    ) -> Result<Self, ConfigError> {
        let user = DeserializedConfig::from_location(root, location, warnings)?;
        let mut config = Self::resolve(root, user.unwrap_or_default());

        if env_replay {
            debug!("config: replay enabled through {REPLAY_ENV}");
            config.replay = true;
        }

        if config.binary.is_none() {
            config.binary = lookup_binary(DEFAULT_BINARY_NAME);
        }
        if config.binary.is_none() && !config.replay {
            return Err(ConfigError::BinaryNotFound {
                name: DEFAULT_BINARY_NAME.to_owned(),
            });
        }

        if let Some(dir) = &config.plugin_cache_dir {
            fs::create_dir_all(dir).map_err(|error| ConfigError::PluginCacheDirCreate {
                path: dir.clone(),
                error,
            })?;
        }

        Ok(config)
    }

    /// Returns the built-in defaults, without reading any files or the environment.
    ///
    /// No binary is set, and the plugin cache is disabled.
    pub fn defaults() -> Self {
        let defaults = DefaultConfig::from_embedded();
        Self {
            teardown: TeardownPolicy::lenient_default(&defaults.teardown),
            lock: defaults.lock,
            module_dir: None,
            plugin_cache_dir: None,
            binary: None,
            replay: defaults.replay,
        }
    }

    fn resolve(root: &Utf8Path, user: DeserializedConfig) -> Self {
        let defaults = DefaultConfig::from_embedded();
        let resolve_path = |path: Utf8PathBuf| {
            if path.is_relative() {
                root.join(path)
            } else {
                path
            }
        };

        Self {
            teardown: TeardownPolicy::lenient_default(
                user.teardown.as_deref().unwrap_or(&defaults.teardown),
            ),
            lock: LockOptions::new(
                user.lock.timeout.unwrap_or(defaults.lock.timeout),
                user.lock.poll_interval.unwrap_or(defaults.lock.poll_interval),
            ),
            module_dir: user.module_dir.map(resolve_path),
            plugin_cache_dir: Some(resolve_path(
                user.plugin_cache_dir.unwrap_or(defaults.plugin_cache_dir),
            )),
            binary: user.binary,
            replay: user.replay.unwrap_or(defaults.replay),
        }
    }

    /// The default teardown policy for fixtures that don't set one.
    pub fn teardown(&self) -> TeardownPolicy {
        self.teardown
    }

    /// Lock timing for marker operations.
    pub fn lock(&self) -> &LockOptions {
        &self.lock
    }

    /// A directory searched first when resolving module directories.
    pub fn module_dir(&self) -> Option<&Utf8Path> {
        self.module_dir.as_deref()
    }

    /// The shared provider plugin cache.
    pub fn plugin_cache_dir(&self) -> Option<&Utf8Path> {
        self.plugin_cache_dir.as_deref()
    }

    /// The provisioning binary, if one was configured or found.
    pub fn binary(&self) -> Option<&Utf8Path> {
        self.binary.as_deref()
    }

    /// Whether recorded state is used instead of provisioning.
    pub fn replay(&self) -> bool {
        self.replay
    }

    /// Sets the default teardown policy.
    pub fn with_teardown(mut self, teardown: TeardownPolicy) -> Self {
        self.teardown = teardown;
        self
    }

    /// Sets lock timing.
    pub fn with_lock(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the module search directory.
    pub fn with_module_dir(mut self, module_dir: Option<Utf8PathBuf>) -> Self {
        self.module_dir = module_dir;
        self
    }

    /// Sets the plugin cache directory.
    pub fn with_plugin_cache_dir(mut self, dir: Option<Utf8PathBuf>) -> Self {
        self.plugin_cache_dir = dir;
        self
    }

    /// Sets the provisioning binary.
    pub fn with_binary(mut self, binary: Option<Utf8PathBuf>) -> Self {
        self.binary = binary;
        self
    }

    /// Enables or disables replay mode.
    pub fn with_replay(mut self, replay: bool) -> Self {
        self.replay = replay;
        self
    }
}

trait ConfigWarnings {
    fn unknown_config_keys(&mut self, config_file: &Utf8Path, unknown: &BTreeSet<String>);
}

struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(&mut self, config_file: &Utf8Path, unknown: &BTreeSet<String>) {
        let mut unknown_str = String::new();
        if unknown.len() == 1 {
            unknown_str.push_str("key: ");
            unknown_str.extend(unknown.iter().map(String::as_str));
        } else {
            unknown_str.push_str("keys:\n");
            for ignored_key in unknown {
                unknown_str.push_str("\n  - ");
                unknown_str.push_str(ignored_key);
            }
        }

        warn!("in config file {config_file}, ignoring unknown configuration {unknown_str}");
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeserializedConfig {
    #[serde(default)]
    teardown: Option<String>,
    #[serde(default)]
    lock: DeserializedLockConfig,
    #[serde(default)]
    module_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    plugin_cache_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    binary: Option<Utf8PathBuf>,
    #[serde(default)]
    replay: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeserializedLockConfig {
    #[serde(default, with = "humantime_serde::option")]
    timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    poll_interval: Option<Duration>,
}

impl DeserializedConfig {
    fn from_location(
        root: &Utf8Path,
        location: ConfigLocation<'_>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Option<Self>, ConfigError> {
        match location {
            ConfigLocation::Isolated => {
                debug!("config: skipping project config (isolated)");
                Ok(None)
            }
            ConfigLocation::Explicit(path) => match Self::from_path(path, warnings)? {
                Some(config) => Ok(Some(config)),
                None => Err(ConfigError::FileNotFound {
                    path: path.to_owned(),
                }),
            },
            ConfigLocation::Default => Self::from_path(&root.join(CONFIG_PATH), warnings),
        }
    }

    /// Returns `Ok(None)` if the file doesn't exist.
    fn from_path(
        path: &Utf8Path,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Option<Self>, ConfigError> {
        debug!("config: attempting to load from {path}");
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!("config: file does not exist at {path}");
                return Ok(None);
            }
            Err(error) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    error,
                });
            }
        };

        let (config, unknown) =
            Self::deserialize_toml(&contents).map_err(|error| ConfigError::Parse {
                path: path.to_owned(),
                error,
            })?;
        if !unknown.is_empty() {
            warnings.unknown_config_keys(path, &unknown);
        }

        Ok(Some(config))
    }

    fn deserialize_toml(contents: &str) -> Result<(Self, BTreeSet<String>), toml::de::Error> {
        let deserializer = toml::Deserializer::parse(contents)?;
        let mut unknown = BTreeSet::new();
        let config: DeserializedConfig = serde_ignored::deserialize(deserializer, |path| {
            unknown.insert(path.to_string());
        })?;
        Ok((config, unknown))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DefaultConfig {
    teardown: String,
    replay: bool,
    plugin_cache_dir: Utf8PathBuf,
    lock: LockOptions,
}

impl DefaultConfig {
    const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Panics if the embedded TOML is invalid or contains unknown keys.
    fn from_embedded() -> Self {
        let deserializer = toml::Deserializer::parse(Self::DEFAULT_CONFIG)
            .expect("embedded default config should parse");
        let mut unknown = BTreeSet::new();
        let config: DefaultConfig =
            serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
                unknown.insert(path.to_string());
            })
            .expect("embedded default config should be valid");

        if !unknown.is_empty() {
            panic!(
                "found unknown keys in default config: {}",
                unknown.into_iter().collect::<Vec<_>>().join(", ")
            );
        }
        config
    }
}
