use std::{
    fs::File,
    io::{Error, ErrorKind, Read},
    path::Path,
};

use acsvm::VmConfig;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

/// Logger configuration used by the runner.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggerConfig {
    pub level_filter: LevelFilter,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level_filter: LevelFilter::Info,
        }
    }
}

/// Everything the runner reads from its JSON configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub vm: VmConfig,
    pub logger: LoggerConfig,
    /// Ticks to run before giving up on scripts that never finish.
    pub max_ticks: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            vm: VmConfig::default(),
            logger: LoggerConfig::default(),
            max_ticks: 10_000,
        }
    }
}

pub struct RunConfigReader;

impl RunConfigReader {
    pub fn read_run_json(path: &Path) -> Result<RunConfig, Error> {
        if !path.exists() {
            return Err(Error::new(ErrorKind::NotFound, "File not found"));
        }
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let config = serde_json::from_slice(bytes.as_slice())?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{ "vm": { "branch_limit": 12 }, "logger": { "level_filter": "DEBUG" } }"#).unwrap();
        assert_eq!(config.vm.branch_limit, 12);
        assert_eq!(config.vm.func_base, 256);
        assert_eq!(config.logger.level_filter, LevelFilter::Debug);
        assert_eq!(config.max_ticks, 10_000);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = RunConfigReader::read_run_json(Path::new("/nonexistent/run.json")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
