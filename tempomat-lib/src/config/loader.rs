use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::{Error, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(&p)
        .map_err(|e| Error::Config(format!("failed to read config file: {e}")))?;
    let mut config: Config = serde_json::from_str(&txt)
        .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

    config.finalize();

    Ok(config)
}
