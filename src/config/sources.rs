use std::path::Path;

use super::models::Config;

const DEFAULT_CONFIG_BASENAME: &str = "config/loadvault";
const ENV_PREFIX: &str = "LOADVAULT";

/// Load from the default file location (optional) plus environment.
pub(super) fn load() -> Result<Config, config::ConfigError> {
    builder(None)?.try_deserialize()
}

/// Load from an explicit file plus environment.
pub(super) fn load_from_path(path: &Path) -> Result<Config, config::ConfigError> {
    builder(Some(path))?.try_deserialize()
}

fn builder(path: Option<&Path>) -> Result<config::Config, config::ConfigError> {
    let mut builder = config::Config::builder();

    builder = match path {
        Some(path) => builder.add_source(config::File::from(path)),
        None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_BASENAME).required(false)),
    };

    // Environment overrides everything: LOADVAULT__<SECTION>__<KEY>.
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    builder.build()
}
