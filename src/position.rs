//! Device position, used only to centre the initial map viewport.

use crate::config::PositionConfig;
use async_trait::async_trait;
use serde::Serialize;

/// Span of the initial viewport around the user's position, in degrees.
pub const VIEWPORT_DELTA: f64 = 0.0001;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PositionUnavailableError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("timed out waiting for a position fix")]
    Timeout,
}

/// One-shot source of the current position.
#[async_trait]
pub trait PositionProvider: Send + Sync {
    async fn current_position(&self) -> Result<Coordinate, PositionUnavailableError>;
}

/// Always reports the same coordinate.
#[derive(Debug, Clone, Copy)]
pub struct FixedPosition(pub Coordinate);

impl FixedPosition {
    /// `None` unless both latitude and longitude are configured.
    pub fn from_config(config: &PositionConfig) -> Option<Self> {
        match (config.latitude, config.longitude) {
            (Some(lat), Some(lon)) => Some(Self(Coordinate::new(lat, lon))),
            _ => None,
        }
    }
}

#[async_trait]
impl PositionProvider for FixedPosition {
    async fn current_position(&self) -> Result<Coordinate, PositionUnavailableError> {
        if self.0.is_valid() {
            Ok(self.0)
        } else {
            Err(PositionUnavailableError::Unavailable(format!(
                "configured position {},{} is out of range",
                self.0.latitude, self.0.longitude
            )))
        }
    }
}

/// Provider for hosts with no positioning source.
#[derive(Debug, Clone, Default)]
pub struct UnavailablePosition {
    pub reason: Option<String>,
}

#[async_trait]
impl PositionProvider for UnavailablePosition {
    async fn current_position(&self) -> Result<Coordinate, PositionUnavailableError> {
        Err(PositionUnavailableError::Unavailable(
            self.reason
                .clone()
                .unwrap_or_else(|| "no positioning source".to_string()),
        ))
    }
}

/// Visible map region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Viewport {
    pub latitude: f64,
    pub longitude: f64,
    pub latitude_delta: f64,
    pub longitude_delta: f64,
}

impl Viewport {
    pub fn around(center: Coordinate) -> Self {
        Self {
            latitude: center.latitude,
            longitude: center.longitude,
            latitude_delta: VIEWPORT_DELTA,
            longitude_delta: VIEWPORT_DELTA,
        }
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (latitude - self.latitude).abs() <= self.latitude_delta / 2.0
            && (longitude - self.longitude).abs() <= self.longitude_delta / 2.0
    }
}

/// Ask the provider once. A failure leaves the viewport uninitialized.
pub async fn initial_viewport(provider: &dyn PositionProvider) -> Option<Viewport> {
    match provider.current_position().await {
        Ok(coord) => {
            tracing::debug!(lat = coord.latitude, lon = coord.longitude, "Initial viewport");
            Some(Viewport::around(coord))
        }
        Err(e) => {
            tracing::warn!("Viewport stays uninitialized: {e}");
            None
        }
    }
}
