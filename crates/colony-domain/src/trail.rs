use serde::{Deserialize, Serialize};

use crate::{
    ensure_non_empty, validate_identifier, validate_unit_interval, ColonyError, DateTimeUtc, RunId,
    TrailId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scent {
    Discovery,
    Warning,
    Blocker,
    Hot,
    Cold,
    Success,
}

impl Scent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Warning => "warning",
            Self::Blocker => "blocker",
            Self::Hot => "hot",
            Self::Cold => "cold",
            Self::Success => "success",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discovery" => Some(Self::Discovery),
            "warning" => Some(Self::Warning),
            "blocker" => Some(Self::Blocker),
            "hot" => Some(Self::Hot),
            "cold" => Some(Self::Cold),
            "success" => Some(Self::Success),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    #[default]
    File,
    Directory,
    Symbol,
    Task,
}

impl LocationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Symbol => "symbol",
            Self::Task => "task",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "file" => Some(Self::File),
            "directory" => Some(Self::Directory),
            "symbol" => Some(Self::Symbol),
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

/// Input for laying a new trail marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTrail {
    pub run_id: Option<RunId>,
    pub location: String,
    pub location_type: LocationType,
    pub scent: Scent,
    pub strength: f64,
    pub agent_id: String,
    pub message: String,
    pub tags: Vec<String>,
    pub ttl_seconds: Option<i64>,
}

impl NewTrail {
    #[must_use]
    pub fn new(
        location: impl Into<String>,
        scent: Scent,
        agent_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id: None,
            location: location.into(),
            location_type: LocationType::File,
            scent,
            strength: 1.0,
            agent_id: agent_id.into(),
            message: message.into(),
            tags: Vec::new(),
            ttl_seconds: None,
        }
    }

    #[must_use]
    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    #[must_use]
    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    #[must_use]
    pub fn with_location_type(mut self, location_type: LocationType) -> Self {
        self.location_type = location_type;
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    #[must_use]
    pub fn with_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    /// # Errors
    /// Returns [`ColonyError::Validation`] for an out-of-range strength, an
    /// unsafe agent id, an empty location or a non-positive ttl.
    pub fn validate(&self) -> Result<(), ColonyError> {
        validate_unit_interval("strength", self.strength)?;
        validate_identifier("agent_id", &self.agent_id)?;
        ensure_non_empty("location", &self.location)?;
        if let Some(ttl) = self.ttl_seconds {
            if ttl <= 0 {
                return Err(ColonyError::Validation(format!(
                    "ttl_seconds MUST be positive, got {ttl}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trail {
    pub trail_id: TrailId,
    pub run_id: Option<RunId>,
    pub location: String,
    pub location_type: LocationType,
    pub scent: Scent,
    pub strength: f64,
    pub agent_id: String,
    pub message: String,
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<DateTimeUtc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrailQuery {
    pub scent: Option<Scent>,
    pub location: Option<String>,
    pub run_id: Option<RunId>,
    pub limit: usize,
    pub min_strength: Option<f64>,
}

impl Default for TrailQuery {
    fn default() -> Self {
        Self {
            scent: None,
            location: None,
            run_id: None,
            limit: 50,
            min_strength: None,
        }
    }
}

/// Per-location aggregate of unexpired trails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HotSpot {
    pub location: String,
    pub trail_count: u64,
    pub max_strength: f64,
    pub total_strength: f64,
    pub scents: Vec<Scent>,
    pub agents: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: DateTimeUtc,
}
