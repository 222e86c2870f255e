use std::fmt;

/// How much history a pass reconciles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// No cursor yet: pull a large batch and offer every active record
    Initial,
    /// Only records changed after the cursor
    Incremental(String),
}

impl SyncMode {
    pub fn from_cursor(cursor: Option<String>) -> Self {
        cursor.map_or(Self::Initial, Self::Incremental)
    }

    pub fn cursor(&self) -> Option<&str> {
        match self {
            Self::Initial => None,
            Self::Incremental(cursor) => Some(cursor),
        }
    }

    pub const fn is_initial(&self) -> bool {
        matches!(self, Self::Initial)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Incremental(cursor) => write!(f, "incremental since {cursor}"),
        }
    }
}
