use std::collections::HashMap;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use skillbridge_common::AppError;

use crate::config::PaymentsConfig;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment provider unreachable: {0}")]
    Network(String),

    #[error("Payment provider error: {0}")]
    Gateway(String),

    #[error("Invalid payment request: {0}")]
    InvalidRequest(String),

    #[error("Payment provider is not configured")]
    NotConfigured,
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        AppError::ExternalService(err.to_string())
    }
}

/// Intent as returned by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        idempotency_key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PaymentIntent, PaymentError>;
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    amount: i64,
    currency: String,
    status: String,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeError {
    error: StripeErrorDetails,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetails {
    message: String,
}

fn zero_decimal(currency: &str) -> bool {
    matches!(currency.to_uppercase().as_str(), "JPY" | "KRW")
}

/// Amount in the currency's smallest unit.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, PaymentError> {
    let scaled = if zero_decimal(currency) {
        amount.round()
    } else {
        (amount * Decimal::ONE_HUNDRED).round()
    };
    scaled
        .to_i64()
        .filter(|units| *units > 0)
        .ok_or_else(|| PaymentError::InvalidRequest(format!("amount {} is not payable", amount)))
}

pub fn from_minor_units(units: i64, currency: &str) -> Decimal {
    if zero_decimal(currency) {
        Decimal::new(units, 0)
    } else {
        Decimal::new(units, 2)
    }
}

#[derive(Clone)]
pub struct StripeProvider {
    client: Client,
    secret_key: String,
    base_url: String,
}

impl StripeProvider {
    pub fn new(config: &PaymentsConfig) -> Self {
        Self {
            client: Client::new(),
            secret_key: config.stripe_secret_key.clone(),
            base_url: config.stripe_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn auth_header(&self) -> String {
        let credentials = format!("{}:", self.secret_key);
        format!("Basic {}", general_purpose::STANDARD.encode(credentials.as_bytes()))
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        idempotency_key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PaymentIntent, PaymentError> {
        if self.secret_key.is_empty() {
            return Err(PaymentError::NotConfigured);
        }

        let mut params = vec![
            ("amount".to_string(), to_minor_units(amount, currency)?.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
        ];
        let mut keys: Vec<_> = metadata.keys().collect();
        keys.sort();
        for key in keys {
            params.push((format!("metadata[{}]", key), metadata[key].clone()));
        }

        let response = self
            .client
            .post(format!("{}/payment_intents", self.base_url))
            .header("Authorization", self.auth_header())
            .header("Idempotency-Key", idempotency_key)
            .form(&params)
            .send()
            .await
            .map_err(|e| PaymentError::Network(e.to_string()))?;

        if response.status().is_success() {
            let intent: StripePaymentIntent = response
                .json()
                .await
                .map_err(|_| PaymentError::Gateway("Invalid response".to_string()))?;
            Ok(PaymentIntent {
                amount: from_minor_units(intent.amount, &intent.currency),
                id: intent.id,
                client_secret: intent.client_secret,
                currency: intent.currency,
                status: intent.status,
            })
        } else {
            let status = response.status();
            let error: StripeError = response
                .json()
                .await
                .map_err(|_| PaymentError::Gateway(format!("Provider returned {}", status)))?;
            Err(PaymentError::Gateway(error.error.message))
        }
    }
}
