use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub generation_api_url: String,
    pub generation_api_key: String,
    pub generation_model: String,
    pub publishing_api_url: String,
    pub publishing_api_key: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            generation_api_url: env::var("GENERATION_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            generation_api_key: env::var("GENERATION_API_KEY")
                .context("GENERATION_API_KEY must be set")?,
            generation_model: env::var("GENERATION_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            publishing_api_url: env::var("PUBLISHING_API_URL")
                .context("PUBLISHING_API_URL must be set")?,
            publishing_api_key: env::var("PUBLISHING_API_KEY")
                .context("PUBLISHING_API_KEY must be set")?,
        })
    }
}
