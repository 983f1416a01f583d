use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use flight_aggregator::{
    AppConfig, CabinClass, FailurePolicy, FlightSearchService, InMemoryReferenceSource,
    ProviderSelection, ReferenceData, SortOptions, UnifiedSearchParameters,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "flight-search")]
#[command(about = "Search every configured flight provider and print the ranked offers")]
struct Cli {
    /// Origin location code, e.g. LHR
    origin: String,
    /// Destination location code, e.g. JFK
    destination: String,
    /// Departure date (YYYY-MM-DD)
    #[arg(long)]
    date: NaiveDate,
    /// Return date for a round trip (YYYY-MM-DD)
    #[arg(long)]
    return_date: Option<NaiveDate>,
    #[arg(long, default_value_t = 1)]
    adults: u8,
    #[arg(long, default_value_t = 0)]
    children: u8,
    #[arg(long, default_value_t = 0)]
    infants: u8,
    /// economy, premium_economy, business or first
    #[arg(long)]
    cabin: Option<CabinClass>,
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,
    #[arg(long)]
    non_stop: bool,
    #[arg(long, default_value = "USD")]
    currency: String,
    #[arg(long)]
    max_price: Option<Decimal>,
    #[arg(long)]
    max_results: Option<u32>,
    /// Only query these providers
    #[arg(long, value_delimiter = ',')]
    providers: Vec<String>,
    /// price, duration, departure, arrival, stops, airline or overall
    #[arg(long, default_value = "price")]
    sort: String,
    #[arg(long, default_value = "asc")]
    direction: String,
    /// Fail unless every provider answers
    #[arg(long)]
    all_or_nothing: bool,
    /// JSON file with airports and airlines used to name carriers
    #[arg(long)]
    reference: Option<PathBuf>,
}

impl Cli {
    fn parameters(&self) -> UnifiedSearchParameters {
        let mut params = UnifiedSearchParameters::new(&self.origin, &self.destination, self.date)
            .with_passengers(self.adults, self.children, self.infants)
            .with_included_carriers(&self.include)
            .with_excluded_carriers(&self.exclude)
            .with_non_stop(self.non_stop)
            .with_currency(&self.currency);
        if let Some(return_date) = self.return_date {
            params = params.with_return_date(return_date);
        }
        if let Some(cabin) = self.cabin {
            params = params.with_cabin_class(cabin);
        }
        if let Some(max_price) = self.max_price {
            params = params.with_max_price(max_price);
        }
        if let Some(max_results) = self.max_results {
            params = params.with_max_results(max_results);
        }
        params
    }

    fn selection(&self) -> ProviderSelection {
        if self.providers.is_empty() {
            ProviderSelection::All
        } else {
            ProviderSelection::named(self.providers.iter().cloned())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flight_aggregator=info,flight_search=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load().context("Failed to load config")?;
    let service = FlightSearchService::from_config(&config).context("Failed to configure providers")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling outstanding provider calls");
            on_interrupt.cancel();
        }
    });

    let policy = if cli.all_or_nothing {
        FailurePolicy::AllOrNothing
    } else {
        FailurePolicy::PartialResults
    };
    let search = service
        .search(
            &cli.parameters(),
            &cli.selection(),
            &SortOptions::new(&cli.sort, &cli.direction),
            policy,
            &cancel,
        )
        .await?;

    let mut carriers = BTreeMap::new();
    if let Some(path) = &cli.reference {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let reference = ReferenceData::new(
            Arc::new(InMemoryReferenceSource::from_json(&raw)?),
            Arc::clone(service.cache()),
            config.reference.ttl(),
        );
        for offer in &search.response.offers {
            for code in offer.marketing_carriers() {
                if !carriers.contains_key(code) {
                    if let Some(airline) = reference.airline(code).await? {
                        carriers.insert(code.to_string(), airline.name);
                    }
                }
            }
        }
    }

    let failures: BTreeMap<&str, String> = search
        .failures
        .iter()
        .map(|(provider, error)| (provider.as_str(), error.source.to_string()))
        .collect();
    let output = serde_json::json!({
        "providers_queried": search.providers_queried,
        "providers_succeeded": search.providers_succeeded,
        "failures": failures,
        "carriers": carriers,
        "offers": search.response.offers,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
