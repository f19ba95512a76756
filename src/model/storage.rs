use crate::model::Config;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

const CONFIG_PATH: &str = "/etc/zsys/config.json";

pub fn load_config() -> Result<Config> {
    load_config_from(Path::new(CONFIG_PATH))
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let file = File::open(path).context(format!("cannot open configuration at {}", path.display()))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).context(format!("invalid configuration at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config_from(Path::new("/nonexistent/zsys-config.json")).unwrap();
        assert_eq!(config.history.keep_last, Config::default().history.keep_last);
    }
}
