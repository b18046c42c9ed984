use crate::config::EngineConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads engine configuration by merging TOML, environment variables, and JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load() -> Result<EngineConfig> {
        Self::figment(Path::new("config/FactorLab.toml"), None)
            .extract()
            .context("Failed to load engine configuration")
    }

    /// Loads engine configuration from an explicit TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        Self::figment(path, None)
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    /// Loads engine configuration with a specific profile overlay.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_with_profile(profile: &str) -> Result<EngineConfig> {
        Self::figment(Path::new("config/FactorLab.toml"), Some(profile))
            .extract()
            .with_context(|| format!("Failed to load configuration profile '{profile}'"))
    }

    fn figment(base: &Path, profile: Option<&str>) -> Figment {
        let mut figment = Figment::new().merge(Toml::file(base));

        if let Some(profile) = profile {
            figment = figment.merge(Toml::file(format!("config/FactorLab.{profile}.toml")));
        }

        figment
            .merge(Env::prefixed("FACTOR_LAB_").split("__"))
            .join(Json::file("config/FactorLab.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GapPolicy;
    use figment::Jail;

    #[test]
    fn missing_files_yield_defaults() {
        Jail::expect_with(|_jail| {
            let config = ConfigLoader::load().expect("defaults should load");
            assert_eq!(config, EngineConfig::default());
            Ok(())
        });
    }

    #[test]
    fn toml_overrides_are_applied() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file(
                "config/FactorLab.toml",
                r#"
                [correlation]
                redundancy_threshold = 0.8

                [regime]
                hysteresis = 2.5
                gap_policy = "unassigned"
                "#,
            )?;

            let config = ConfigLoader::load().expect("config should load");
            assert!((config.correlation.redundancy_threshold - 0.8).abs() < f64::EPSILON);
            assert!((config.regime.hysteresis - 2.5).abs() < f64::EPSILON);
            assert_eq!(config.regime.gap_policy, GapPolicy::Unassigned);
            assert_eq!(config.statistics.quantiles, 5);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_toml() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file(
                "config/FactorLab.toml",
                "[statistics]\nmin_instruments = 40\n",
            )?;
            jail.set_env("FACTOR_LAB_STATISTICS__MIN_INSTRUMENTS", "25");

            let config = ConfigLoader::load().expect("config should load");
            assert_eq!(config.statistics.min_instruments, 25);
            Ok(())
        });
    }

    #[test]
    fn profile_overlay_wins_over_base() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file("config/FactorLab.toml", "[backtest]\ninitial_nav = 1.0\n")?;
            jail.create_file(
                "config/FactorLab.research.toml",
                "[backtest]\ninitial_nav = 100.0\n",
            )?;

            let config = ConfigLoader::load_with_profile("research").expect("profile loads");
            assert!((config.backtest.initial_nav - 100.0).abs() < f64::EPSILON);
            Ok(())
        });
    }
}
