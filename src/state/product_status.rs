/// Product status definitions for persisted records
use std::fmt;

/// Classification stored with every persisted product row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProductStatus {
    /// Fetched and parsed completely
    Success,

    /// Fetched, but the parser could only recover part of the record
    Partial,

    /// The retailer reports the product does not exist (terminal, not a failure)
    NotFound,
}

impl ProductStatus {
    /// Only successful rows are skipped when a run resumes
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Converts the status to a string for database storage
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::NotFound => "not_found",
        }
    }

    /// Parses a status from its database representation
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "not_found" => Some(Self::NotFound),
            _ => None,
        }
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
