use std::path::PathBuf;

use anyhow::bail;
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use hf2_debug::compiler::Artifacts;
use hf2_debug::link::hf2::Hf2Options;
use hf2_debug::SessionConfig;
use serde::{Deserialize, Serialize};

use crate::logging::LevelFilter;

/// Prefix of the environment variables that override configuration keys.
const ENV_PREFIX: &str = "HF2DBG_";

/// A struct which holds all config sources.
#[derive(Debug, Clone)]
pub struct Configs {
    figment: Figment,
}

/// The main struct holding all the possible config options.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub general: General,
    pub device: Hf2Options,
    pub session: SessionConfig,
    pub artifacts: Artifacts,
}

/// The general config struct holding all the possible general options.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct General {
    pub log_level: Option<LevelFilter>,
    pub log_file: Option<PathBuf>,
}

impl Configs {
    pub fn new(conf_dir: PathBuf) -> Configs {
        // Start off by merging in the default configuration file.
        let mut figment = Figment::new().merge(Toml::string(include_str!("default.toml")));

        // Project files first, personal overrides after them.
        let config_files = [".hf2dbg", ".hf2dbg.local"];

        for file in &config_files {
            figment = figment
                .merge(Toml::file(conf_dir.join(format!("{file}.toml"))))
                .merge(Json::file(conf_dir.join(format!("{file}.json"))))
                .merge(Yaml::file(conf_dir.join(format!("{file}.yaml"))))
                .merge(Yaml::file(conf_dir.join(format!("{file}.yml"))));
        }

        Configs { figment }
    }

    /// Merges an explicitly given config file on top of the discovered ones.
    pub fn merge(&mut self, conf_file: PathBuf) -> anyhow::Result<()> {
        let original = self.figment.clone();
        self.figment = match conf_file.extension().and_then(|e| e.to_str()) {
            Some("toml") => original.merge(Toml::file(conf_file)),
            Some("json") => original.merge(Json::file(conf_file)),
            Some("yml" | "yaml") => original.merge(Yaml::file(conf_file)),
            _ => {
                bail!(
                    "File format not recognized from extension (supported: .toml, .json, .yaml / .yml)"
                )
            }
        };
        Ok(())
    }

    /// Extracts the configuration, with environment overrides applied last.
    pub fn extract(self) -> anyhow::Result<Config> {
        let figment = self
            .figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<Config>() {
            Ok(config) => Ok(config),
            Err(errors) => bail!(
                "Failed to parse supplied configuration:\n{}",
                errors
                    .into_iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<String>>()
                    .join("\n")
            ),
        }
    }

    #[cfg(test)]
    fn with_toml(self, toml: &str) -> Configs {
        Configs {
            figment: self.figment.merge(Toml::string(toml)),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use hf2_debug::HaltStrategy;
    use pretty_assertions::assert_eq;

    use super::Configs;

    fn configs() -> Configs {
        // Points at a directory without config files.
        Configs::new(std::env::temp_dir().join("hf2dbg-no-config"))
    }

    #[test]
    fn default_config_parses() {
        let config = configs().extract().unwrap();

        assert_eq!(config.session.halt_strategy, HaltStrategy::Auto);
        assert_eq!(config.session.poll_interval, Duration::from_millis(200));
        assert_eq!(config.device.request_timeout, Duration::from_secs(2));
        assert_eq!(config.device.vendor_id, None);
        assert!(config.artifacts.build_command.is_empty());
    }

    #[test]
    fn later_sources_override_defaults() {
        let config = configs()
            .with_toml(
                r#"
                [device]
                vendor_id = 0x239a

                [session]
                halt_strategy = "poll"
                poll_interval = 50
                "#,
            )
            .extract()
            .unwrap();

        assert_eq!(config.device.vendor_id, Some(0x239a));
        assert_eq!(config.device.reconnect_timeout, Duration::from_secs(10));
        assert_eq!(config.session.halt_strategy, HaltStrategy::Poll);
        assert_eq!(config.session.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn unknown_config_items_fail() {
        let result = configs()
            .with_toml(
                r#"
                [session]
                bogus_invalid_item = "oops"
                "#,
            )
            .extract();

        assert!(result.is_err());
    }

    #[test]
    fn file_name_patterns() {
        // Existence of files is not tested here, so it is fine to use a file that does not exist
        configs().merge("nonexistent-file.yml".into()).unwrap();
        configs()
            .merge("nonexistent-file.unknown".into())
            .unwrap_err();
    }
}
