// Inbound search operation: validate, fan out, merge, filter, rank

use crate::cache::Cache;
use crate::config::AppConfig;
use crate::dispatcher::{ProviderDispatcher, ProviderSelection};
use crate::error::{AggregationError, ProviderError, SearchError};
use crate::model::{UnifiedFlightSearchResponse, UnifiedSearchParameters};
use crate::providers::{ComparisonProvider, FlightProvider, GdsProvider, MetasearchProvider};
use crate::ranking::RankingEngine;
use crate::token::AccessTokenCache;
use crate::transport::HttpTransport;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    PartialResults,
    AllOrNothing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOptions {
    pub sort_by: String,
    pub direction: String,
}

impl SortOptions {
    pub fn new(sort_by: &str, direction: &str) -> Self {
        Self {
            sort_by: sort_by.to_string(),
            direction: direction.to_string(),
        }
    }
}

impl Default for SortOptions {
    fn default() -> Self {
        Self::new("price", "asc")
    }
}

#[derive(Debug, Clone)]
pub struct AggregatedSearch {
    pub response: UnifiedFlightSearchResponse,
    pub failures: BTreeMap<String, ProviderError>,
    pub providers_queried: usize,
    pub providers_succeeded: usize,
}

impl AggregatedSearch {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct FlightSearchService {
    dispatcher: ProviderDispatcher,
    ranking: RankingEngine,
    cache: Arc<Cache>,
}

impl FlightSearchService {
    pub fn new(dispatcher: ProviderDispatcher, ranking: RankingEngine, cache: Arc<Cache>) -> Self {
        Self {
            dispatcher,
            ranking,
            cache,
        }
    }

    // Wires one cache, transport and token cache into every configured provider
    pub fn from_config(config: &AppConfig) -> Result<Self, SearchError> {
        let cache = Arc::new(Cache::new(config.cache.clone()));
        let transport = HttpTransport::new(config.http.timeout())?;
        let tokens = Arc::new(AccessTokenCache::new(
            Arc::clone(&cache),
            transport.clone(),
            config.tokens.safety_buffer(),
        ));

        let mut dispatcher = ProviderDispatcher::new(&config.dispatcher);
        let providers = &config.providers;
        if let Some(gds) = &providers.gds {
            let provider = GdsProvider::new(gds.clone(), Arc::clone(&tokens), transport.clone())?;
            dispatcher.register(Arc::new(provider))?;
        }
        if let Some(comparison) = &providers.comparison {
            let provider = ComparisonProvider::new(comparison.clone(), transport.clone())?;
            dispatcher.register(Arc::new(provider))?;
        }
        if let Some(metasearch) = &providers.metasearch {
            let provider = MetasearchProvider::new(metasearch.clone(), Arc::clone(&tokens), transport)?;
            dispatcher.register(Arc::new(provider))?;
        }

        if dispatcher.is_empty() {
            warn!("no providers configured");
        }
        info!(providers = ?dispatcher.provider_names(), "flight search service ready");
        Ok(Self::new(
            dispatcher,
            RankingEngine::new(config.ranking.clone()),
            cache,
        ))
    }

    pub fn register(&mut self, provider: Arc<dyn FlightProvider>) -> Result<(), SearchError> {
        self.dispatcher.register(provider)
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.dispatcher.provider_names()
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    #[instrument(skip_all, fields(origin = %params.origin, destination = %params.destination, ?policy))]
    pub async fn search(
        &self,
        params: &UnifiedSearchParameters,
        selection: &ProviderSelection,
        sort: &SortOptions,
        policy: FailurePolicy,
        cancel: &CancellationToken,
    ) -> Result<AggregatedSearch, AggregationError> {
        params.validate()?;

        let outcomes = self.dispatcher.search_all(params, selection, cancel).await;
        let providers_queried = outcomes.len();

        let mut response = UnifiedFlightSearchResponse::default();
        let mut failures = BTreeMap::new();
        for (provider, result) in outcomes {
            match result {
                Ok(offers) => response.merge(offers),
                Err(error) => {
                    failures.insert(provider, error);
                }
            }
        }
        let providers_succeeded = providers_queried - failures.len();

        if cancel.is_cancelled() && providers_succeeded == 0 {
            return Err(AggregationError::Cancelled);
        }
        if policy == FailurePolicy::AllOrNothing && !failures.is_empty() {
            return Err(AggregationError::ProviderFailures(failures));
        }

        let merged = response.len();
        response.offers.retain(|offer| params.accepts(offer));
        if merged != response.len() {
            debug!(dropped = merged - response.len(), "removed offers violating the search filters");
        }
        self.ranking.rank(&mut response, &sort.sort_by, &sort.direction);

        info!(
            offers = response.len(),
            providers_queried,
            providers_succeeded,
            "search complete"
        );
        Ok(AggregatedSearch {
            response,
            failures,
            providers_queried,
            providers_succeeded,
        })
    }
}
