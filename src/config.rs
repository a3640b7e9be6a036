use std::path::{Path, PathBuf};

use crate::protocol::DeviceCredential;

/// Application configuration, resolved from the CLI.
pub struct Config {
    pub email: String,
    pub device_token: String,
    pub device_id: String,
    pub db_path: PathBuf,
    pub scratch_dir: PathBuf,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("email", &self.email)
            .field("device_token", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("db_path", &self.db_path)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(cli: &crate::cli::Cli) -> anyhow::Result<Self> {
        let config = Self {
            email: cli.email.clone(),
            device_token: cli.device_token.clone(),
            device_id: cli.device_id.clone(),
            db_path: expand_tilde(&cli.db),
            scratch_dir: expand_tilde(&cli.scratch_dir),
        };
        config.ensure_directories()?;
        Ok(config)
    }

    pub fn credential(&self) -> DeviceCredential {
        DeviceCredential {
            email: self.email.clone(),
            device_token: self.device_token.clone(),
            device_id: self.device_id.clone(),
        }
    }

    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir(parent)?;
        }
        create_dir(&self.scratch_dir)?;
        Ok(())
    }
}

fn create_dir(path: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| anyhow::anyhow!("cannot create {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_with_home() {
        let result = expand_tilde("~/photos/index.db");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("photos/index.db"));
        }
    }

    #[test]
    fn expand_tilde_no_prefix() {
        assert_eq!(
            expand_tilde("/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(expand_tilde("relative/path"), PathBuf::from("relative/path"));
    }

    #[test]
    fn debug_redacts_device_token() {
        let config = Config {
            email: "u@example.com".into(),
            device_token: "aas_et/secret".into(),
            device_id: "1".into(),
            db_path: PathBuf::from("/tmp/index.db"),
            scratch_dir: PathBuf::from("/tmp/scratch"),
        };
        let text = format!("{config:?}");
        assert!(!text.contains("secret"));
        assert!(text.contains("<redacted>"));
    }
}
