use std::{fs, io::Write, path::Path};

use anyhow::{Context, Result, bail};
use shared::SyncConfig;

/// Writes a default configuration file into the current directory.
///
/// # Arguments
/// * `format` - The format of the configuration file ("yaml" or "json").
///
/// # Errors
/// Returns an error if the format is unsupported or if writing the file fails.
pub fn generate_config(format: &str) -> Result<()> {
    let file_name = write_default_config(format, Path::new("."))?;
    println!("Configuration file '{file_name}' generated successfully.");
    Ok(())
}

/// Serializes the defaults into `dir` and returns the file name used.
///
/// # Errors
/// Returns an error for unsupported formats or when the file cannot be written.
pub fn write_default_config(format: &str, dir: &Path) -> Result<&'static str> {
    let config = SyncConfig::with_defaults();
    let (file_name, serialized) = match format {
        "yaml" => ("config.yaml", serde_yml::to_string(&config)?),
        "json" => ("config.json", serde_json::to_string_pretty(&config)?),
        _ => bail!("Unsupported format. Use 'yaml' or 'json'."),
    };

    let path = dir.join(file_name);
    let mut file = fs::File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(serialized.as_bytes())?;
    Ok(file_name)
}
