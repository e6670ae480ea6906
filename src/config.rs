use serde::Deserialize;
use std::{env, fmt, fs, io, path::Path};

const SETTINGS_FILENAME: &str = "settings.json";

/// Server settings: defaults, then `settings.json` if present, then
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub port: u16,
    pub data_path: String,
    pub static_dir: String,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub version: String,
    pub app_url: String,
    pub default_admin_email: String,
    pub default_admin_password: String,
    pub mattermost: MattermostSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MattermostSettings {
    pub client_id: String,
    pub client_secret: String,
    pub server_url: String,
    pub redirect_uri: String,
    pub bot_token: String,
    /// Channel that receives "task assigned" notifications. Empty disables them.
    pub task_channel_id: String,
}

impl MattermostSettings {
    pub fn oauth_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty() && !self.server_url.is_empty()
    }

    pub fn bot_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.server_url.is_empty()
    }

    pub fn server(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_addr: "0.0.0.0".to_string(),
            port: 8090,
            data_path: "taskdesk.redb".to_string(),
            static_dir: "frontend/dist".to_string(),
            jwt_secret: "change-me-in-production".to_string(),
            token_ttl_hours: 24 * 7,
            version: "unknown".to_string(),
            app_url: "http://localhost:5173".to_string(),
            default_admin_email: "admin@example.com".to_string(),
            default_admin_password: "changeme123".to_string(),
            mattermost: MattermostSettings::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read(io::Error),
    Parse(serde_json::Error),
    Invalid { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "cannot read {SETTINGS_FILENAME}: {e}"),
            ConfigError::Parse(e) => write!(f, "cannot parse {SETTINGS_FILENAME}: {e}"),
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: `{value}`"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Settings {
    /// Load `settings.json` from the working directory (optional) and apply
    /// environment overrides.
    pub fn load() -> Result<Settings, ConfigError> {
        let mut settings = Settings::from_file(Path::new(SETTINGS_FILENAME))?;
        settings.apply_overrides(|name| env::var(name).ok())?;
        Ok(settings)
    }

    fn from_file(path: &Path) -> Result<Settings, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map_err(ConfigError::Parse),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(ConfigError::Read(e)),
        }
    }

    /// Override fields from a variable lookup. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let strings: [(&str, &mut String); 14] = [
            ("BIND_ADDR", &mut self.bind_addr),
            ("DATA_PATH", &mut self.data_path),
            ("STATIC_DIR", &mut self.static_dir),
            ("JWT_SECRET", &mut self.jwt_secret),
            ("VERSION", &mut self.version),
            ("APP_URL", &mut self.app_url),
            ("DEFAULT_ADMIN_EMAIL", &mut self.default_admin_email),
            ("DEFAULT_ADMIN_PASSWORD", &mut self.default_admin_password),
            ("MATTERMOST_CLIENT_ID", &mut self.mattermost.client_id),
            ("MATTERMOST_CLIENT_SECRET", &mut self.mattermost.client_secret),
            ("MATTERMOST_SERVER_URL", &mut self.mattermost.server_url),
            ("MATTERMOST_REDIRECT_URI", &mut self.mattermost.redirect_uri),
            ("MATTERMOST_BOT_TOKEN", &mut self.mattermost.bot_token),
            ("MATTERMOST_TASK_CHANNEL_ID", &mut self.mattermost.task_channel_id),
        ];
        for (name, field) in strings {
            if let Some(value) = var(name) {
                *field = value;
            }
        }

        if let Some(value) = var("PORT") {
            self.port = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var: "PORT", value })?;
        }
        if let Some(value) = var("TOKEN_TTL_HOURS") {
            self.token_ttl_hours = match value.trim().parse::<i64>() {
                Ok(hours) if hours > 0 => hours,
                _ => return Err(ConfigError::Invalid { var: "TOKEN_TTL_HOURS", value }),
            };
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// ── Tests ──────────────────────────────────────────────────────
