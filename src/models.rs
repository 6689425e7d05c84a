use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MarketError;

/// Text-backed enum stored in SQLite as its lowercase label.
macro_rules! text_enum {
    ($name:ident, $what:literal { $($variant:ident => $label:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = MarketError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($label => Ok($name::$variant),)+
                    other => Err(MarketError::invalid(format!(
                        "unknown {} '{}' (expected one of: {})",
                        $what,
                        other,
                        [$($label),+].join(", ")
                    ))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse().map_err(|e: MarketError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum!(Role, "role" {
    User => "user",
    Admin => "admin",
});

impl Role {
    pub fn toggled(self) -> Role {
        match self {
            Role::User => Role::Admin,
            Role::Admin => Role::User,
        }
    }
}

text_enum!(OrganizationType, "organization type" {
    Manufacturing => "manufacturing",
    Research => "research",
    Recycling => "recycling",
    WasteManagement => "waste_management",
    Consulting => "consulting",
    Investment => "investment",
});

text_enum!(MaterialKind, "material type" {
    Waste => "waste",
    Requirement => "requirement",
});

text_enum!(MatchStatus, "match status" {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
});

/// The only transitions a caller may request on a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDecision {
    Accept,
    Reject,
}

impl MatchDecision {
    pub fn target(self) -> MatchStatus {
        match self {
            MatchDecision::Accept => MatchStatus::Accepted,
            MatchDecision::Reject => MatchStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub company_id: i64,
    pub role: Option<String>, // free-text job title of the contact, not the access role
    pub location: Option<String>,
    pub organization_type: Option<OrganizationType>,
    pub materials_of_interest: Option<String>, // comma-separated keywords
    pub sustainability_goals: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    pub id: i64,
    pub company_id: i64,
    pub company_name: Option<String>, // denormalized for convenience
    pub material_name: String,
    pub quantity: f64,
    pub unit: String,
    #[serde(rename = "type")]
    pub kind: MaterialKind,
    pub description: Option<String>,
    pub created_at: String,
}

/// Input for a new material listing.
#[derive(Debug, Clone)]
pub struct NewMaterial {
    pub company_id: i64,
    pub material_name: String,
    pub quantity: f64,
    pub unit: String,
    pub kind: MaterialKind,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchDetails {
    pub category_match: f64,
    pub keyword_overlap: f64,
    pub distance_km: Option<f64>,
    pub quantity_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: i64,
    pub waste_id: i64,
    pub consumer_id: i64,
    pub score: f64, // 0..=1
    pub details: MatchDetails,
    pub status: MatchStatus,
    pub created_at: String,
    pub material_name: Option<String>,
    pub supplier_name: Option<String>,
    pub consumer_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRecommendation {
    pub id: i64,
    pub company_id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub description: String,
    pub confidence: f64, // 0..=100
    pub action_url: Option<String>,
    pub status: String,
    pub created_at: String,
}

/// Input for a stored recommendation.
#[derive(Debug, Clone)]
pub struct NewRecommendation {
    pub company_id: i64,
    pub kind: String,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    pub action_url: Option<String>,
}
