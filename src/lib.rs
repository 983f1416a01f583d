// Multi-provider flight search aggregation

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod providers;
pub mod ranking;
pub mod reference;
pub mod token;
pub mod transport;

// Re-export key types for convenience
pub use aggregator::{AggregatedSearch, FailurePolicy, FlightSearchService, SortOptions};
pub use cache::{Cache, CacheConfig, CacheKey, CacheStats, CacheStatsReport};
pub use config::AppConfig;
pub use dispatcher::{DispatcherConfig, ProviderDispatcher, ProviderOutcome, ProviderSelection};
pub use error::{AggregationError, ProviderError, SearchError};
pub use model::{
    CabinClass, FlightPoint, Itinerary, Money, Passengers, Segment, UnifiedFlightOffer,
    UnifiedFlightSearchResponse, UnifiedSearchParameters,
};
pub use providers::FlightProvider;
pub use ranking::{RankingEngine, RankingWeights, SortDirection, SortKey};
pub use reference::{Airline, Airport, InMemoryReferenceSource, ReferenceData, ReferenceDataSource};
pub use token::{AccessToken, AccessTokenCache, ClientCredentials};
pub use transport::HttpTransport;
