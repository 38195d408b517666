use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }

    pub fn from_env() -> Self {
        Self {
            host: env_or("DATABASE_HOST", "localhost"),
            port: env_parse("DATABASE_PORT", 5432),
            username: env_or("DATABASE_USERNAME", "skillbridge_user"),
            password: env_or("DATABASE_PASSWORD", "skillbridge_password"),
            database: env_or("DATABASE_NAME", "skillbridge"),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: u64,
    pub issuer: String,
}

impl JwtConfig {
    pub fn from_env() -> Self {
        Self {
            secret: env_or("JWT_SECRET", "dev-secret-key-change-in-production"),
            expiration_hours: env_parse("JWT_EXPIRATION_HOURS", 24),
            issuer: env_or("JWT_ISSUER", "skillbridge"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

/// Reads `key`, falling back to `default` when unset.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Reads and parses `key`; unset or unparsable values fall back to `default`.
pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_is_postgres_url() {
        let config = DatabaseConfig {
            host: "db".into(),
            port: 5433,
            username: "u".into(),
            password: "p".into(),
            database: "engagements".into(),
            max_connections: 5,
        };
        assert_eq!(config.connection_string(), "postgresql://u:p@db:5433/engagements");
    }

    #[test]
    fn unparsable_values_fall_back_to_default() {
        std::env::set_var("SKILLBRIDGE_TEST_PORT", "not-a-port");
        assert_eq!(env_parse("SKILLBRIDGE_TEST_PORT", 8080u16), 8080);
        std::env::set_var("SKILLBRIDGE_TEST_PORT", " 9090 ");
        assert_eq!(env_parse("SKILLBRIDGE_TEST_PORT", 8080u16), 9090);
        std::env::remove_var("SKILLBRIDGE_TEST_PORT");
    }
}
