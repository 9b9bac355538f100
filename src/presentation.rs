//! View-model for list and map renderers, built from a store snapshot.
//!
//! Renderers hold on to [`MarkerListItem::marker`] and pass it back to
//! [`SyncEngine::approve`](crate::sync::SyncEngine::approve) when the user
//! taps "approve".

use crate::marker::{Icon, MapImage, Marker, MarkerKey};
use crate::store::MarkerStore;
use serde::Serialize;

/// One row of the marker list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerListItem {
    pub key: MarkerKey,
    pub title: String,
    pub description: String,
    pub icon: Icon,
    #[serde(skip)]
    pub marker: Marker,
}

impl From<&Marker> for MarkerListItem {
    fn from(marker: &Marker) -> Self {
        Self {
            key: marker.key(),
            title: marker.address.clone(),
            description: approval_description(marker.approve_count),
            icon: marker.kind.icon(),
            marker: marker.clone(),
        }
    }
}

/// One pin on the map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapPin {
    pub key: MarkerKey,
    pub latitude: f64,
    pub longitude: f64,
    pub image: MapImage,
}

impl From<&Marker> for MapPin {
    fn from(marker: &Marker) -> Self {
        Self {
            key: marker.key(),
            latitude: marker.latitude,
            longitude: marker.longitude,
            image: marker.kind.map_image(),
        }
    }
}

pub fn approval_description(count: u64) -> String {
    format!("Approved by {count} people")
}

pub fn list_items(store: &MarkerStore) -> Vec<MarkerListItem> {
    store.list().iter().map(MarkerListItem::from).collect()
}

pub fn map_pins(store: &MarkerStore) -> Vec<MapPin> {
    store.list().iter().map(MapPin::from).collect()
}
