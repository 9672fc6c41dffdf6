use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    // 网络配置
    /// REST session service base URL; empty means "use `ws_url` directly".
    pub api_url: String,
    pub ws_url: String,
    pub api_token: String,
    pub user_id: String,

    // 采集配置
    pub capture_device: String,
    pub noise_suppress_db: i32,

    // 会话配置
    pub session_type: String,
    pub target_breath_duration: f64,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME").to_string(),
            app_version: env!("APP_VERSION").to_string(),

            api_url: env!("API_URL").to_string(),
            ws_url: env!("WS_URL").to_string(),
            api_token: env!("API_TOKEN").to_string(),
            user_id: env!("USER_ID").to_string(),

            capture_device: env!("CAPTURE_DEVICE").to_string(),
            noise_suppress_db: env!("NOISE_SUPPRESS_DB")
                .parse()
                .map_err(|_| "Failed to parse NOISE_SUPPRESS_DB")?,

            session_type: env!("SESSION_TYPE").to_string(),
            target_breath_duration: env!("TARGET_BREATH_DURATION")
                .parse()
                .map_err(|_| "Failed to parse TARGET_BREATH_DURATION")?,
        })
    }

    /// Build-time configuration with `BREATH_*` overrides from the process environment.
    pub fn load() -> Result<Self, &'static str> {
        let mut config = Self::new()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply runtime overrides. `lookup` maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BREATH_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = lookup("BREATH_WS_URL") {
            self.ws_url = v;
        }
        if let Some(v) = lookup("BREATH_API_TOKEN") {
            self.api_token = v;
        }
        if let Some(v) = lookup("BREATH_USER_ID") {
            self.user_id = v;
        }
        if let Some(v) = lookup("BREATH_CAPTURE_DEVICE") {
            self.capture_device = v;
        }
        if let Some(v) = lookup("BREATH_TARGET_DURATION") {
            match v.parse::<f64>() {
                Ok(d) if d > 0.0 => self.target_breath_duration = d,
                _ => log::warn!("Ignoring invalid BREATH_TARGET_DURATION: {}", v),
            }
        }
    }

    /// Whether a session service is configured.
    pub fn has_session_service(&self) -> bool {
        !self.api_url.trim().is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().unwrap_or_else(|e| {
            log::error!("{}, falling back to built-in defaults", e);
            Self {
                app_name: env!("APP_NAME").to_string(),
                app_version: env!("APP_VERSION").to_string(),
                api_url: String::new(),
                ws_url: "ws://localhost:8000/api/meditation/ws/breath".to_string(),
                api_token: String::new(),
                user_id: "local-user".to_string(),
                capture_device: "default".to_string(),
                noise_suppress_db: -25,
                session_type: "guided".to_string(),
                target_breath_duration: 4.0,
            }
        })
    }
}
