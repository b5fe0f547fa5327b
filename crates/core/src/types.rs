use serde::{Deserialize, Serialize};

/// How a feed is scheduled, stored in the `streams.mode` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    AlwaysOn,
    OnDemand,
    Smart,
}

impl StreamMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlwaysOn => "always_on",
            Self::OnDemand => "on_demand",
            Self::Smart => "smart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "always_on" => Some(Self::AlwaysOn),
            "on_demand" => Some(Self::OnDemand),
            "smart" => Some(Self::Smart),
            _ => None,
        }
    }

    /// Smart mode follows the on-demand start path until a richer policy
    /// exists, so both count as viewer-driven.
    pub fn is_on_demand(self) -> bool {
        matches!(self, Self::OnDemand | Self::Smart)
    }
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last supervisor intent recorded in the catalog. The in-memory registry,
/// not this column, is authoritative for liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Stopped,
    Starting,
    Running,
    Reconnecting,
    Error,
}

impl StreamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(Self::Stopped),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "reconnecting" => Some(Self::Reconnecting),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HLS segmentation profile: shorter segments for lower glass-to-glass
/// delay, longer for robustness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMode {
    Low,
    Stable,
}

impl LatencyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Stable => "stable",
        }
    }

    /// Unrecognized or missing values fall back to stable.
    pub fn parse(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            _ => Self::Stable,
        }
    }
}

impl std::fmt::Display for LatencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
