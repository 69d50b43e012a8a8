use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deployment environment, detected by substring match so that values like
/// `"prod-eu-1"` or `"staging2"` select the right behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Test,
    Staging,
    Production,
}

impl Environment {
    pub fn detect(raw: &str) -> Self {
        let raw = raw.to_ascii_lowercase();
        if raw.contains("prod") {
            Environment::Production
        } else if raw.contains("stag") {
            Environment::Staging
        } else if raw.contains("test") {
            Environment::Test
        } else {
            Environment::Development
        }
    }

    /// Production and staging: registry token mandatory, stack traces
    /// collapsed, docs endpoint hidden.
    pub fn is_production_like(&self) -> bool {
        matches!(self, Environment::Production | Environment::Staging)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// URL the registry listens on (`YAMF_REGISTRY_URL`).
    pub registry_url: Option<String>,
    /// URL of the gateway (`YAMF_GATEWAY_URL`), used by the gateway itself
    /// and by the registry for pre-registration and change notification.
    pub gateway_url: Option<String>,
    /// Shared secret for protected commands (`YAMF_REGISTRY_TOKEN`).
    pub registry_token: Option<String>,
    /// Override for a service's home `scheme://host` (`YAMF_SERVICE_URL`).
    pub service_url: Option<String>,
    /// Raw `ENVIRONMENT` value; see [`Environment::detect`].
    pub environment: String,
    /// Total inbound request budget in seconds.
    pub request_timeout_secs: u64,
    /// Header-read budget in seconds. Kept as a knob for deployments that
    /// front the process with a proxy able to enforce it.
    pub header_timeout_secs: u64,
    /// Downstream timeout for proxied calls. `None` leaves streams unbounded.
    pub proxy_timeout_secs: Option<u64>,
    /// Credentials for the bundled auth provider (`ADMIN_USER`/`ADMIN_SECRET`).
    pub admin_user: Option<String>,
    pub admin_secret: Option<String>,
    /// `LOG_INCLUDE_LINES`: include file/line in log output.
    pub log_include_lines: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            registry_url: None,
            gateway_url: None,
            registry_token: None,
            service_url: None,
            environment: String::new(),
            request_timeout_secs: 60,
            header_timeout_secs: 30,
            proxy_timeout_secs: None,
            admin_user: None,
            admin_secret: None,
            log_include_lines: false,
        }
    }
}

impl Config {
    /// Load config from the environment, layered on top of an optional TOML
    /// file named by `YAMF_CONFIG`. Env vars always win over file values.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var("YAMF_CONFIG") {
            Ok(path) => Config::from_file(&path)?,
            Err(_) => Config::default(),
        };

        if let Ok(v) = std::env::var("YAMF_REGISTRY_URL") {
            config.registry_url = Some(v);
        }
        if let Ok(v) = std::env::var("YAMF_GATEWAY_URL") {
            config.gateway_url = Some(v);
        }
        if let Ok(v) = std::env::var("YAMF_REGISTRY_TOKEN") {
            config.registry_token = Some(v);
        }
        if let Ok(v) = std::env::var("YAMF_SERVICE_URL") {
            config.service_url = Some(v);
        }
        if let Ok(v) = std::env::var("ENVIRONMENT") {
            config.environment = v;
        }
        if let Ok(v) = std::env::var("ADMIN_USER") {
            config.admin_user = Some(v);
        }
        if let Ok(v) = std::env::var("ADMIN_SECRET") {
            config.admin_secret = Some(v);
        }
        if let Ok(v) = std::env::var("LOG_INCLUDE_LINES") {
            config.log_include_lines = matches!(v.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn env(&self) -> Environment {
        Environment::detect(&self.environment)
    }

    /// Bootstrap validation for the registry. Fatal when the environment is
    /// production-like and no registry token or gateway URL is configured; a
    /// warning in any other non-dev environment.
    pub fn validate_for_registry(&self) -> anyhow::Result<()> {
        let env = self.env();
        if self.registry_token.is_none() {
            if env.is_production_like() {
                anyhow::bail!(
                    "YAMF_REGISTRY_TOKEN is required in {} environments",
                    env.as_str()
                );
            }
            if !env.is_development() {
                tracing::warn!(
                    environment = env.as_str(),
                    "no registry token configured; protected commands are open"
                );
            }
        }
        if env.is_production_like() && self.gateway_url.is_none() {
            anyhow::bail!("YAMF_GATEWAY_URL is required in {} environments", env.as_str());
        }
        Ok(())
    }

    pub fn validate_for_gateway(&self) -> anyhow::Result<()> {
        let env = self.env();
        if env.is_production_like() && self.registry_token.is_none() {
            anyhow::bail!(
                "YAMF_REGISTRY_TOKEN is required in {} environments",
                env.as_str()
            );
        }
        Ok(())
    }

    /// Port embedded in `registry_url`, if it parses.
    pub fn registry_port(&self) -> Option<u16> {
        let url = reqwest::Url::parse(self.registry_url.as_deref()?).ok()?;
        url.port_or_known_default()
    }

    /// The fallback start port for service setup: registry port + 1, or
    /// 10000 when the registry URL carries no usable port.
    pub fn default_start_port(&self) -> u16 {
        self.registry_port()
            .and_then(|p| p.checked_add(1))
            .unwrap_or(10000)
    }

    /// A short fingerprint of the registry token, safe for logs.
    pub fn token_fingerprint(&self) -> Option<String> {
        let token = self.registry_token.as_deref()?;
        let digest = Sha256::digest(token.as_bytes());
        Some(hex::encode(digest)[..12].to_string())
    }
}
