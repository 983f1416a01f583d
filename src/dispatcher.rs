// Concurrent fan-out of one search to the registered providers

use crate::error::{ProviderError, SearchError};
use crate::model::{UnifiedFlightSearchResponse, UnifiedSearchParameters};
use crate::providers::FlightProvider;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub type ProviderOutcome = (String, Result<UnifiedFlightSearchResponse, ProviderError>);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProviderSelection {
    #[default]
    All,
    Named(BTreeSet<String>),
}

impl ProviderSelection {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProviderSelection::Named(names.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub per_provider_timeout_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            per_provider_timeout_seconds: 10,
        }
    }
}

impl DispatcherConfig {
    pub fn per_provider_timeout(&self) -> Duration {
        Duration::from_secs(self.per_provider_timeout_seconds)
    }
}

pub struct ProviderDispatcher {
    providers: Vec<Arc<dyn FlightProvider>>,
    per_provider_timeout: Duration,
}

impl ProviderDispatcher {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self::with_timeout(config.per_provider_timeout())
    }

    pub fn with_timeout(per_provider_timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            per_provider_timeout,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn FlightProvider>) -> Result<(), SearchError> {
        let name = provider.provider_name();
        if self.providers.iter().any(|p| p.provider_name() == name) {
            return Err(SearchError::Configuration(format!(
                "provider {} is already registered",
                name
            )));
        }
        debug!(provider = name, "registered provider");
        self.providers.push(provider);
        Ok(())
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.provider_name()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    // Outcomes arrive in completion order. Unknown names get a Configuration slot,
    // and no provider is started once the token has fired.
    #[instrument(skip_all, fields(origin = %params.origin, destination = %params.destination))]
    pub async fn search_all(
        &self,
        params: &UnifiedSearchParameters,
        selection: &ProviderSelection,
        cancel: &CancellationToken,
    ) -> Vec<ProviderOutcome> {
        let (targets, mut outcomes) = self.resolve(selection);

        // Dropping this call cancels whatever is still running
        let dispatch = cancel.child_token();
        let _cancel_on_drop = dispatch.clone().drop_guard();

        let mut running = FuturesUnordered::new();
        for provider in targets {
            let name = provider.provider_name().to_string();
            if dispatch.is_cancelled() {
                outcomes.push((name.clone(), Err(ProviderError::new(name, SearchError::Cancelled))));
                continue;
            }

            let params = params.clone();
            let task_cancel = dispatch.child_token();
            let timeout = self.per_provider_timeout;
            let handle = tokio::spawn(run_provider(provider, params, task_cancel, timeout));
            running.push(handle.map(move |joined| (name, joined)));
        }

        while let Some((name, joined)) = running.next().await {
            let result = joined.unwrap_or_else(|join_error| {
                let reason = if join_error.is_panic() {
                    "provider task panicked".to_string()
                } else {
                    format!("provider task aborted: {}", join_error)
                };
                Err(ProviderError::new(name.clone(), SearchError::TaskFailed(reason)))
            });

            match &result {
                Ok(response) => info!(provider = %name, offers = response.len(), "provider succeeded"),
                Err(error) => warn!(provider = %name, %error, "provider failed"),
            }
            outcomes.push((name, result));
        }
        outcomes
    }

    fn resolve(&self, selection: &ProviderSelection) -> (Vec<Arc<dyn FlightProvider>>, Vec<ProviderOutcome>) {
        match selection {
            ProviderSelection::All => (self.providers.clone(), Vec::new()),
            ProviderSelection::Named(names) => {
                let targets = self
                    .providers
                    .iter()
                    .filter(|p| names.contains(p.provider_name()))
                    .cloned()
                    .collect();
                let unknown = names
                    .iter()
                    .filter(|name| !self.providers.iter().any(|p| p.provider_name() == name.as_str()))
                    .map(|name| {
                        let error = SearchError::Configuration(format!("unknown provider {}", name));
                        (name.clone(), Err(ProviderError::new(name.clone(), error)))
                    })
                    .collect();
                (targets, unknown)
            }
        }
    }
}

async fn run_provider(
    provider: Arc<dyn FlightProvider>,
    params: UnifiedSearchParameters,
    cancel: CancellationToken,
    timeout: Duration,
) -> Result<UnifiedFlightSearchResponse, ProviderError> {
    let name = provider.provider_name().to_string();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::new(name, SearchError::Cancelled)),
        outcome = tokio::time::timeout(timeout, provider.search_flights(&params, &cancel)) => {
            outcome.unwrap_or_else(|_| {
                Err(ProviderError::new(
                    name,
                    SearchError::timeout(format!("no response within {:?}", timeout)),
                ))
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::model::fixtures::{offer, segment};
    use crate::model::Itinerary;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub enum Behaviour {
        Offers(Vec<i64>),
        Fail(SearchError),
        Panic,
    }

    // Canned provider that ignores cancellation, so the dispatcher has to enforce it
    pub struct StubProvider {
        pub name: String,
        pub delay: Duration,
        pub behaviour: Behaviour,
        pub calls: AtomicUsize,
    }

    impl StubProvider {
        pub fn new(name: &str, delay_ms: u64, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                delay: Duration::from_millis(delay_ms),
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FlightProvider for StubProvider {
        fn provider_name(&self) -> &str {
            &self.name
        }

        async fn search_flights(
            &self,
            _params: &UnifiedSearchParameters,
            _cancel: &CancellationToken,
        ) -> Result<UnifiedFlightSearchResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match &self.behaviour {
                Behaviour::Offers(prices) => Ok(UnifiedFlightSearchResponse::new(
                    prices
                        .iter()
                        .map(|price| {
                            let mut offer = offer(
                                *price,
                                vec![Itinerary::new(
                                    vec![segment("BA", "LHR", "2025-06-01T08:00", "JFK", "2025-06-01T11:00")],
                                    None,
                                )],
                            );
                            offer.provider = self.name.clone();
                            offer
                        })
                        .collect(),
                )),
                Behaviour::Fail(error) => Err(ProviderError::new(self.name.clone(), error.clone())),
                Behaviour::Panic => panic!("{} blew up", self.name),
            }
        }
    }
}
