use chrono::Duration;
use serde::{Deserialize, Serialize};

use skillbridge_common::{env_or, env_parse, AppError, DatabaseConfig, JwtConfig, ServerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementsConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub policy: LifecyclePolicy,
    pub scheduler: SchedulerConfig,
    pub payments: PaymentsConfig,
    pub store_backend: StoreBackend,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Time rules for sessions and reschedules. Minutes and hours are kept as
/// plain integers so the policy serializes cleanly into health output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    pub early_join_minutes: u32,
    pub grace_minutes: u32,
    pub booking_lead_minutes: i64,
    pub auto_approve_hours: i64,
    pub coach_cutoff_hours: i64,
    pub min_notice_hours: i64,
    pub response_hours: i64,
    pub max_conflict_retries: u32,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            early_join_minutes: 15,
            grace_minutes: 10,
            booking_lead_minutes: 1,
            auto_approve_hours: 5,
            coach_cutoff_hours: 10,
            min_notice_hours: 1,
            response_hours: 24,
            max_conflict_retries: 3,
        }
    }
}

impl LifecyclePolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            early_join_minutes: env_parse("SESSION_EARLY_JOIN_MINUTES", defaults.early_join_minutes),
            grace_minutes: env_parse("SESSION_GRACE_MINUTES", defaults.grace_minutes),
            booking_lead_minutes: env_parse("BOOKING_LEAD_MINUTES", defaults.booking_lead_minutes),
            auto_approve_hours: env_parse("RESCHEDULE_AUTO_APPROVE_HOURS", defaults.auto_approve_hours),
            coach_cutoff_hours: env_parse("RESCHEDULE_COACH_CUTOFF_HOURS", defaults.coach_cutoff_hours),
            min_notice_hours: env_parse("RESCHEDULE_MIN_NOTICE_HOURS", defaults.min_notice_hours),
            response_hours: env_parse("RESCHEDULE_RESPONSE_HOURS", defaults.response_hours),
            max_conflict_retries: env_parse("MAX_CONFLICT_RETRIES", defaults.max_conflict_retries),
        }
    }

    pub fn booking_lead(&self) -> Duration {
        Duration::minutes(self.booking_lead_minutes)
    }

    pub fn auto_approve_after(&self) -> Duration {
        Duration::hours(self.auto_approve_hours)
    }

    pub fn coach_cutoff(&self) -> Duration {
        Duration::hours(self.coach_cutoff_hours)
    }

    pub fn min_notice(&self) -> Duration {
        Duration::hours(self.min_notice_hours)
    }

    pub fn response_window(&self) -> Duration {
        Duration::hours(self.response_hours)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Shared secret the external cron presents; empty disables the check.
    pub token: String,
    pub batch_size: usize,
    pub max_rows_per_sweep: usize,
    pub budget_seconds: u64,
    pub retention_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            batch_size: 100,
            max_rows_per_sweep: 1000,
            budget_seconds: 60,
            retention_days: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            token: env_or("SCHEDULER_TOKEN", ""),
            batch_size: env_parse("TICK_BATCH_SIZE", defaults.batch_size).max(1),
            max_rows_per_sweep: env_parse("TICK_MAX_ROWS", defaults.max_rows_per_sweep),
            budget_seconds: env_parse("TICK_BUDGET_SECONDS", defaults.budget_seconds),
            retention_days: env_parse("RETENTION_DAYS", defaults.retention_days),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentsConfig {
    #[serde(skip_serializing)]
    pub stripe_secret_key: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub stripe_base_url: String,
    pub currency: String,
}

impl PaymentsConfig {
    pub fn from_env() -> Self {
        Self {
            stripe_secret_key: env_or("STRIPE_SECRET_KEY", ""),
            webhook_secret: env_or("STRIPE_WEBHOOK_SECRET", ""),
            stripe_base_url: env_or("STRIPE_BASE_URL", "https://api.stripe.com/v1"),
            currency: env_or("PAYMENT_CURRENCY", "usd").to_lowercase(),
        }
    }
}

impl EngagementsConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let store_backend = match env_or("STORE_BACKEND", "postgres").to_lowercase().as_str() {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(AppError::Validation(format!(
                    "STORE_BACKEND must be 'postgres' or 'memory', got '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            server: ServerConfig {
                host: env_or("ENGAGEMENTS_HOST", "0.0.0.0"),
                port: env_parse("ENGAGEMENTS_PORT", 8006),
                cors_origins: env_or("CORS_ORIGINS", "http://localhost:3000")
                    .split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect(),
            },
            database: DatabaseConfig::from_env(),
            jwt: JwtConfig::from_env(),
            policy: LifecyclePolicy::from_env(),
            scheduler: SchedulerConfig::from_env(),
            payments: PaymentsConfig::from_env(),
            store_backend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults_match_session_rules() {
        let policy = LifecyclePolicy::default();
        assert_eq!(policy.early_join_minutes, 15);
        assert_eq!(policy.grace_minutes, 10);
        assert_eq!(policy.auto_approve_after(), Duration::hours(5));
        assert_eq!(policy.coach_cutoff(), Duration::hours(10));
        assert_eq!(policy.min_notice(), Duration::hours(1));
        assert_eq!(policy.response_window(), Duration::hours(24));
    }

    #[test]
    fn secrets_are_not_serialized() {
        let config = PaymentsConfig {
            stripe_secret_key: "sk_test_123".into(),
            webhook_secret: "whsec_123".into(),
            stripe_base_url: "https://api.stripe.com/v1".into(),
            currency: "usd".into(),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk_test_123"));
        assert!(!json.contains("whsec_123"));
    }
}
