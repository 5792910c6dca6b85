use super::file::load_config;
use async_trait::async_trait;
use hot_reload::{Reload, ReloaderError};
use waypoint_lib::Config;

#[derive(Clone)]
/// Reloader target watching the configuration file
pub(crate) struct ConfigReloader {
  pub(crate) config_path: String,
}

#[async_trait]
impl Reload<Config, String> for ConfigReloader {
  type Source = String;

  async fn new(source: &Self::Source) -> Result<Self, ReloaderError<Config, String>> {
    Ok(Self {
      config_path: source.clone(),
    })
  }

  async fn reload(&self) -> Result<Option<Config>, ReloaderError<Config, String>> {
    let config = load_config(&self.config_path)
      .map_err(|_e| ReloaderError::<Config, String>::Reload("Failed to load the config file".to_string()))?;
    Ok(Some(config))
  }
}
