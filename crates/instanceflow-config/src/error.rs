use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error(
        "Config file not found. Looked in:\n\
        - $INSTANCEFLOW_CONFIG\n\
        - ./instanceflow.yaml\n\
        - ./.instanceflow/instanceflow.yaml\n\
        - ~/.config/instanceflow/config.yaml"
    )]
    ConfigFileNotFound,

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
