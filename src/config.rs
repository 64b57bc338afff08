use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::error::{ChatError, ChatResult};

#[derive(Clone, Debug)]
pub struct Config {
    pub service_addr: String,
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub storage_dir: PathBuf,
    pub max_files_per_message: usize,
    pub default_page_size: i64,
    pub delivery_send_timeout: Duration,
    pub session_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            storage_dir: PathBuf::from("./storage"),
            max_files_per_message: 10,
            default_page_size: 30,
            delivery_send_timeout: Duration::from_millis(2000),
            session_buffer_size: 100,
        }
    }
}

impl Config {
    /// Reads the process environment. Call `dotenv::dotenv()` first to pick
    /// up a `.env` file.
    pub fn from_env() -> ChatResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ChatResult<Self> {
        let defaults = Config::default();

        let config = Config {
            service_addr: lookup("DUET_SERVICE_ADDR").unwrap_or(defaults.service_addr),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            storage_dir: lookup("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            max_files_per_message: parse(
                &lookup,
                "MAX_FILES_PER_MESSAGE",
                defaults.max_files_per_message,
            )?,
            default_page_size: parse(&lookup, "DEFAULT_PAGE_SIZE", defaults.default_page_size)?,
            delivery_send_timeout: Duration::from_millis(parse(
                &lookup,
                "DELIVERY_SEND_TIMEOUT_MS",
                2000u64,
            )?),
            session_buffer_size: parse(
                &lookup,
                "SESSION_BUFFER_SIZE",
                defaults.session_buffer_size,
            )?,
        };

        if config.session_buffer_size == 0 {
            return Err(ChatError::Config(
                "SESSION_BUFFER_SIZE must be at least 1".to_string(),
            ));
        }
        if config.default_page_size < 1 {
            return Err(ChatError::Config(
                "DEFAULT_PAGE_SIZE must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> ChatResult<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ChatError::Config(format!("{} has an invalid value: {:?}", key, raw))),
    }
}
