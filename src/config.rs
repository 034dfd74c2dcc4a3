use anyhow::Context;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub dapr_http_port: u16,
    pub pubsub_name: String,
    pub publish_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            dapr_http_port: 3500,
            pubsub_name: "pubsub".to_string(),
            publish_enabled: true,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let max_connections: u32 = match var("DB_MAX_CONNECTIONS") {
            Some(value) => value
                .parse()
                .with_context(|| format!("DB_MAX_CONNECTIONS must be a positive integer, got {value:?}"))?,
            None => defaults.max_connections,
        };
        let dapr_http_port: u16 = match var("DAPR_HTTP_PORT") {
            Some(value) => value
                .parse()
                .with_context(|| format!("DAPR_HTTP_PORT must be a port number, got {value:?}"))?,
            None => defaults.dapr_http_port,
        };
        let publish_enabled = match var("PUBLISH_ENABLED") {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => anyhow::bail!("PUBLISH_ENABLED must be true or false, got {value:?}"),
            },
            None => defaults.publish_enabled,
        };

        Ok(Self {
            database_url: var("DATABASE_URL"),
            max_connections,
            dapr_http_port,
            pubsub_name: var("PUBSUB_NAME").unwrap_or(defaults.pubsub_name),
            publish_enabled,
        })
    }

    pub fn dapr_base_url(&self) -> String {
        format!("http://localhost:{}", self.dapr_http_port)
    }
}
