//! Marker model shared by the codec, the store and the sync engine.
//!
//! A [`Marker`] carries no identifier field on the wire. Two markers are the
//! same logical entity when their address, category and coordinates agree;
//! [`MarkerKey`] turns that tuple into an explicit, hashable identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Coordinates are quantized to this many steps per degree before hashing
/// (1e-7 degrees, roughly one centimetre at the equator).
const COORD_QUANTUM: f64 = 1e7;

// ── Category ────────────────────────────────────────────────────

/// Marker category, carried on the wire as a small integer.
///
/// Codes outside the known set are kept verbatim in [`MarkerType::Unknown`]
/// so they survive a decode/encode cycle and still participate in identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum MarkerType {
    /// Verified safe spot or checkpoint.
    Safe,
    /// Accident or other road hazard.
    Hazard,
    /// Road works.
    Construction,
    /// Any code this client does not recognise.
    Unknown(i64),
}

impl MarkerType {
    /// Wire code; `Unknown` returns the code it was decoded from.
    pub fn code(self) -> i64 {
        match self {
            Self::Safe => 0,
            Self::Hazard => 1,
            Self::Construction => 2,
            Self::Unknown(code) => code,
        }
    }

    /// Short English name for logs and CLI output.
    pub fn label(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Hazard => "hazard",
            Self::Construction => "construction",
            Self::Unknown(_) => "unknown",
        }
    }

    /// List icon for this category. Unrecognised codes fall back to the
    /// neutral icon.
    pub fn icon(self) -> Icon {
        match self {
            Self::Safe => Icon::Check,
            Self::Hazard => Icon::Alert,
            Self::Construction => Icon::Wrench,
            Self::Unknown(_) => Icon::Neutral,
        }
    }

    /// Map pin artwork for this category.
    pub fn map_image(self) -> MapImage {
        match self {
            Self::Hazard => MapImage::TrafficAccident,
            Self::Construction => MapImage::ConstructionLogo,
            Self::Safe | Self::Unknown(_) => MapImage::CheckpointLogo,
        }
    }
}

impl From<i64> for MarkerType {
    fn from(code: i64) -> Self {
        match code {
            0 => Self::Safe,
            1 => Self::Hazard,
            2 => Self::Construction,
            other => Self::Unknown(other),
        }
    }
}

impl From<MarkerType> for i64 {
    fn from(kind: MarkerType) -> Self {
        kind.code()
    }
}

impl std::fmt::Display for MarkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown({code})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Icon shown next to a marker in the list view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Icon {
    Check,
    Alert,
    Wrench,
    Neutral,
}

impl Icon {
    /// Icon-set name understood by the presentation layer.
    pub fn name(self) -> &'static str {
        match self {
            Self::Check => "shield-check",
            Self::Alert => "alert",
            Self::Wrench => "wrench",
            Self::Neutral => "equal",
        }
    }
}

/// Artwork used for a pin on the map view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MapImage {
    CheckpointLogo,
    TrafficAccident,
    ConstructionLogo,
}

impl MapImage {
    /// Image asset name.
    pub fn asset(self) -> &'static str {
        match self {
            Self::CheckpointLogo => "images/tc_logo.png",
            Self::TrafficAccident => "images/traffic_accident.png",
            Self::ConstructionLogo => "images/construction_logo.png",
        }
    }
}

// ── Identity ────────────────────────────────────────────────────

/// Stable identity of a logical marker: hex SHA-256 over the address, the
/// category code and the quantized coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerKey(String);

impl MarkerKey {
    /// Full 64-character hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, enough for log lines and CLI output.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for MarkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn quantize(degrees: f64) -> i64 {
    (degrees * COORD_QUANTUM).round() as i64
}

// ── Marker ──────────────────────────────────────────────────────

/// A single crowd-sourced map annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    /// Human-readable location label.
    pub address: String,
    /// Decimal degrees, `-90..=90`.
    pub latitude: f64,
    /// Decimal degrees, `-180..=180`.
    pub longitude: f64,
    /// Category; selects the display icon.
    #[serde(rename = "type")]
    pub kind: MarkerType,
    /// Number of approvals accumulated so far.
    #[serde(rename = "approveCount", default)]
    pub approve_count: u64,
}

impl Marker {
    /// A freshly reported marker with no approvals.
    pub fn new(address: impl Into<String>, latitude: f64, longitude: f64, kind: MarkerType) -> Self {
        Self {
            address: address.into(),
            latitude,
            longitude,
            kind,
            approve_count: 0,
        }
    }

    /// Same marker carrying `approve_count` approvals.
    pub fn with_approve_count(mut self, approve_count: u64) -> Self {
        self.approve_count = approve_count;
        self
    }

    /// Identity key for reconciliation. The approval count is not part of it.
    pub fn key(&self) -> MarkerKey {
        let mut hasher = Sha256::new();
        hasher.update((self.address.len() as u64).to_le_bytes());
        hasher.update(self.address.as_bytes());
        hasher.update(self.kind.code().to_le_bytes());
        hasher.update(quantize(self.latitude).to_le_bytes());
        hasher.update(quantize(self.longitude).to_le_bytes());
        MarkerKey(hex::encode(hasher.finalize()))
    }

    /// Same identity, one more approval.
    pub fn approved(&self) -> Self {
        Self {
            approve_count: self.approve_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// True when both coordinates are finite and inside the WGS84 range.
    pub fn has_valid_coordinates(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}
