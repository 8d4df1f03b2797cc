use crate::assistant::gemini::DEFAULT_GEMINI_BASE_URL;
use crate::assistant::{AdminContact, DEFAULT_CHAT_MODEL};
use crate::notification::feed::DEFAULT_FEED_LIMIT;
use crate::notification::presenter::PresentationMode;
use crate::notification::toast::DEFAULT_TOAST_LIMIT;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Postgres store. Unset runs on the in-process store.
    pub database_url: Option<String>,
    /// `CLASSHUB_ENV`, falling back to `RUST_ENV`.
    pub environment: String,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    pub chat_model: String,
    pub feed_limit: usize,
    pub admin_name: String,
    pub admin_email: String,
    /// Toasts visible at once.
    pub toast_limit: usize,
}

impl Config {
    pub fn presentation(&self) -> PresentationMode {
        PresentationMode::from_env_name(&self.environment)
    }

    pub fn is_production(&self) -> bool {
        self.presentation() == PresentationMode::Production
    }

    pub fn admin_contact(&self) -> AdminContact {
        AdminContact {
            name: self.admin_name.clone(),
            email: self.admin_email.clone(),
        }
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let environment = var("CLASSHUB_ENV")
            .or_else(|| var("RUST_ENV"))
            .unwrap_or_else(|| "development".into());
        let gemini_api_key = var("GEMINI_API_KEY");

        if gemini_api_key.is_none() {
            if PresentationMode::from_env_name(&environment) == PresentationMode::Production {
                anyhow::bail!(
                    "GEMINI_API_KEY is not set. The chat assistants cannot run in production without it."
                );
            }
            tracing::warn!("GEMINI_API_KEY is not set; chat assistants will answer with their apology");
        }

        Ok(Config {
            port: var("CLASSHUB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            database_url: var("DATABASE_URL"),
            environment,
            gemini_api_key,
            gemini_base_url: var("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.into()),
            chat_model: var("CLASSHUB_CHAT_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.into()),
            feed_limit: var("CLASSHUB_FEED_LIMIT")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_FEED_LIMIT),
            admin_name: var("CLASSHUB_ADMIN_NAME").unwrap_or_else(|| "ClassHub Admin".into()),
            admin_email: var("CLASSHUB_ADMIN_EMAIL").unwrap_or_else(|| "admin@classhub.local".into()),
            toast_limit: var("CLASSHUB_TOAST_LIMIT")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_TOAST_LIMIT),
        })
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    Config::from_lookup(|key| std::env::var(key).ok())
}
