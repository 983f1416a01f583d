// Read-only airport and airline lookups, cached as whole lists

use crate::cache::{Cache, CacheKey};
use crate::error::SearchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Airport {
    pub code: String,
    pub name: String,
    pub city: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Airline {
    pub iata_code: String,
    pub name: String,
    pub icao_code: Option<String>,
}

#[async_trait]
pub trait ReferenceDataSource: Send + Sync {
    async fn get_airports(&self) -> Result<Vec<Airport>, SearchError>;

    async fn get_airlines(&self) -> Result<Vec<Airline>, SearchError>;
}

pub struct ReferenceData {
    source: Arc<dyn ReferenceDataSource>,
    cache: Arc<Cache>,
    ttl: Duration,
}

impl ReferenceData {
    pub fn new(source: Arc<dyn ReferenceDataSource>, cache: Arc<Cache>, ttl: Duration) -> Self {
        Self { source, cache, ttl }
    }

    pub async fn airports(&self) -> Result<Arc<Vec<Airport>>, SearchError> {
        let source = Arc::clone(&self.source);
        self.cache
            .get_or_create(
                CacheKey::AllAirports,
                move || async move { source.get_airports().await },
                self.ttl,
            )
            .await
    }

    pub async fn airlines(&self) -> Result<Arc<Vec<Airline>>, SearchError> {
        let source = Arc::clone(&self.source);
        self.cache
            .get_or_create(
                CacheKey::AllAirlines,
                move || async move { source.get_airlines().await },
                self.ttl,
            )
            .await
    }

    pub async fn airport(&self, code: &str) -> Result<Option<Airport>, SearchError> {
        let code = code.trim();
        let airports = self.airports().await?;
        Ok(airports
            .iter()
            .find(|airport| airport.code.eq_ignore_ascii_case(code))
            .cloned())
    }

    pub async fn airline(&self, iata_code: &str) -> Result<Option<Airline>, SearchError> {
        let iata_code = iata_code.trim();
        let airlines = self.airlines().await?;
        Ok(airlines
            .iter()
            .find(|airline| airline.iata_code.eq_ignore_ascii_case(iata_code))
            .cloned())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct InMemoryReferenceSource {
    #[serde(default)]
    airports: Vec<Airport>,
    #[serde(default)]
    airlines: Vec<Airline>,
    #[serde(skip)]
    loads: AtomicUsize,
}

impl InMemoryReferenceSource {
    pub fn new(airports: Vec<Airport>, airlines: Vec<Airline>) -> Self {
        Self {
            airports,
            airlines,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn from_json(source: &str) -> Result<Self, SearchError> {
        serde_json::from_str(source)
            .map_err(|e| SearchError::Configuration(format!("invalid reference data: {}", e)))
    }

    // Number of list loads served, across both lists
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReferenceDataSource for InMemoryReferenceSource {
    async fn get_airports(&self) -> Result<Vec<Airport>, SearchError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!(count = self.airports.len(), "loading airports");
        Ok(self.airports.clone())
    }

    async fn get_airlines(&self) -> Result<Vec<Airline>, SearchError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!(count = self.airlines.len(), "loading airlines");
        Ok(self.airlines.clone())
    }
}
