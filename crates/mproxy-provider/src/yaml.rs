use serde_yaml::Value as YamlValue;
use serde_yaml::value::TaggedValue;

use crate::config::{ConfigError, UserConfig};

/// Parses a user config document, resolving `!env NAME` tags against the
/// process environment before deserializing.
pub fn load_user_config(text: &str) -> Result<UserConfig, ConfigError> {
    load_user_config_with(text, &|name| std::env::var(name).ok())
}

pub fn load_user_config_with(
    text: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<UserConfig, ConfigError> {
    let mut value: YamlValue =
        serde_yaml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
    resolve_env_tags(&mut value, lookup)?;
    serde_yaml::from_value(value).map_err(|err| ConfigError::Parse(err.to_string()))
}

fn resolve_env_tags(
    value: &mut YamlValue,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    match value {
        YamlValue::Tagged(tagged) => {
            if is_env_tag(tagged) {
                let name = tagged
                    .value
                    .as_str()
                    .ok_or_else(|| {
                        ConfigError::Parse("!env tag requires a variable name".to_string())
                    })?
                    .to_string();
                let resolved = lookup(&name).ok_or_else(|| {
                    ConfigError::Parse(format!("environment variable '{name}' is not set"))
                })?;
                *value = YamlValue::String(resolved);
            } else {
                resolve_env_tags(&mut tagged.value, lookup)?;
            }
        }
        YamlValue::Sequence(items) => {
            for item in items {
                resolve_env_tags(item, lookup)?;
            }
        }
        YamlValue::Mapping(mapping) => {
            for (_, item) in mapping.iter_mut() {
                resolve_env_tags(item, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn is_env_tag(tagged: &TaggedValue) -> bool {
    tagged.tag.to_string().trim_start_matches('!') == "env"
}
