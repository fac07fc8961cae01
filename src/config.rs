use serde::Deserialize;

/// Process configuration, loaded once at startup (§4.10). `ENVIRONMENT` only affects
/// logging verbosity defaults; every other field is required.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub room_pool_limit: usize,
    pub side_book_max_size: usize,
    pub side_book_min_size: usize,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_environment() -> String {
    "development".to_string()
}

impl AppConfig {
    /// Loads a local `.env` (if present) and then layers `HOST`, `PORT`, `DATABASE_URL`,
    /// `ROOM_POOL_LIMIT`, `SIDE_BOOK_MAX_SIZE`, `SIDE_BOOK_MIN_SIZE`, `ENVIRONMENT` from
    /// the process environment over a small set of defaults.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 12345)?
            .set_default("room_pool_limit", 64)?
            .set_default("side_book_max_size", 500)?
            .set_default("side_book_min_size", 50)?
            .set_default("environment", "development")?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
