use anyhow::{anyhow, Context, Result};
use clap::Args;
use shared::{
    crypto::keys::DEFAULT_MODULUS_BITS,
    flows::{ClientSettings, StaticDeviceInfo, DEFAULT_RETURN_URL},
    primitives::AutoZeroedByteArray,
    utils::b64_decode,
};
use std::{path::PathBuf, time::Duration};

/// Device-side settings. Every flag can also come from the environment or a `.env` file.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Where connections and key pairs are kept (defaults to ~/.sca-authenticator)
    #[arg(long, env = "SCA_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "SCA_REQUEST_TIMEOUT_SECS", default_value_t = 30, global = true)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "SCA_PUSH_TOKEN", global = true)]
    pub push_token: Option<String>,

    #[arg(long, env = "SCA_APP_LANGUAGE", default_value = "en", global = true)]
    pub app_language: String,

    #[arg(long, env = "SCA_RETURN_URL", default_value = DEFAULT_RETURN_URL, global = true)]
    pub return_url: String,

    /// Base64 AES-256 key; when set, private keys are sealed at rest
    #[arg(long, env = "SCA_STORAGE_KEY", hide_env_values = true, global = true)]
    pub storage_key: Option<String>,

    #[arg(long, env = "SCA_LOG_LEVEL", default_value = "warn", global = true)]
    pub log_level: String,

    #[arg(long, env = "SCA_KEY_BITS", default_value_t = DEFAULT_MODULUS_BITS, global = true)]
    pub key_bits: usize,
}

impl Settings {
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => home::home_dir()
                .map(|home| home.join(".sca-authenticator"))
                .context("could not determine the home directory; set SCA_DATA_DIR"),
        }
    }

    pub fn storage_key(&self) -> Result<Option<AutoZeroedByteArray>> {
        let Some(encoded) = &self.storage_key else {
            return Ok(None);
        };

        let key = b64_decode(encoded).ok_or_else(|| anyhow!("SCA_STORAGE_KEY is not valid base64"))?;
        if key.len() != 32 {
            return Err(anyhow!("SCA_STORAGE_KEY must decode to 32 bytes, got {}", key.len()));
        }
        Ok(Some(AutoZeroedByteArray::new(key)))
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            return_url: self.return_url.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..ClientSettings::default()
        }
    }

    pub fn device_info(&self) -> StaticDeviceInfo {
        StaticDeviceInfo {
            push_token: self.push_token.clone(),
            app_language: self.app_language.clone(),
        }
    }
}
