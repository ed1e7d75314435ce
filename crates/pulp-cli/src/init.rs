use pulp_common::{
    error::{PulpError, PulpResult},
    settings::{get_config, Settings, CONFIG_INSTANCE},
};

use crate::Cli;

/// Load settings once for the process. `--settings` names a file and wins
/// over `--root`.
pub fn init_config(cli: &Cli) -> PulpResult<&'static Settings> {
    let settings = match &cli.settings {
        None => Settings::from_root(cli.root.clone())?,
        Some(settings) => Settings::from_root(Some(settings.clone()))?,
    };
    CONFIG_INSTANCE
        .set(settings)
        .map_err(|_| PulpError::Cli("config already initialized".to_string()))?;
    get_config()
}
