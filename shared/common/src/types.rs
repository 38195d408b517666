use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Student,
    Coach,
    Admin,
}

/// The two sides of a contract. Role-gated mutations compare against this.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Student,
    Coach,
}

impl Party {
    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Student => "student",
            Party::Coach => "coach",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "student" => Some(Party::Student),
            "coach" => Some(Party::Coach),
            _ => None,
        }
    }

    pub fn counterpart(&self) -> Self {
        match self {
            Party::Student => Party::Coach,
            Party::Coach => Party::Student,
        }
    }
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Common response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_round_trips_through_short_strings() {
        for party in [Party::Student, Party::Coach] {
            assert_eq!(Party::parse(party.as_str()), Some(party));
        }
        assert_eq!(Party::parse("admin"), None);
        assert_eq!(Party::Student.counterpart(), Party::Coach);
    }
}
