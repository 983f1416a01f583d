// Price-comparison adapter (static API key)
//
// The vendor has no carrier or price filters, so those are applied after normalization.

use super::{
    api_key_headers, declared_duration, parse_amount, parse_vendor_timestamp, FlightProvider,
};
use crate::error::{ProviderError, SearchError};
use crate::model::{
    CabinClass, FlightPoint, Itinerary, Money, Segment, UnifiedFlightOffer,
    UnifiedFlightSearchResponse, UnifiedSearchParameters,
};
use crate::transport::HttpTransport;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub const PROVIDER_NAME: &str = "comparison";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_key_header: String,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            api_key_header: "X-API-Key".to_string(),
        }
    }
}

// Vendor response
#[derive(Debug, Deserialize)]
struct ComparisonResponse {
    #[serde(default = "default_status")]
    status: bool,
    message: Option<serde_json::Value>,
    data: Option<ComparisonData>,
}

fn default_status() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ComparisonData {
    #[serde(default)]
    itineraries: Vec<ComparisonItinerary>,
}

#[derive(Debug, Deserialize)]
struct ComparisonItinerary {
    id: Option<String>,
    price: Option<ComparisonPrice>,
    #[serde(default)]
    legs: Vec<ComparisonLeg>,
}

#[derive(Debug, Deserialize)]
struct ComparisonPrice {
    raw: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComparisonLeg {
    duration_in_minutes: Option<i64>,
    #[serde(default)]
    segments: Vec<ComparisonSegment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComparisonSegment {
    origin: ComparisonPlace,
    destination: ComparisonPlace,
    departure: String,
    arrival: String,
    flight_number: String,
    marketing_carrier: ComparisonCarrier,
    operating_carrier: Option<ComparisonCarrier>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComparisonPlace {
    display_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComparisonCarrier {
    alternate_id: Option<String>,
}

impl TryFrom<ComparisonSegment> for Segment {
    type Error = SearchError;

    fn try_from(segment: ComparisonSegment) -> Result<Self, Self::Error> {
        let carrier_code = segment.marketing_carrier.alternate_id.ok_or_else(|| {
            SearchError::Normalization(format!(
                "segment {} has no marketing carrier code",
                segment.flight_number
            ))
        })?;

        Ok(Segment {
            carrier_code,
            operating_carrier: segment.operating_carrier.and_then(|carrier| carrier.alternate_id),
            flight_number: segment.flight_number,
            departure: FlightPoint {
                airport: segment.origin.display_code,
                at: parse_vendor_timestamp(&segment.departure)?,
            },
            arrival: FlightPoint {
                airport: segment.destination.display_code,
                at: parse_vendor_timestamp(&segment.arrival)?,
            },
        })
    }
}

impl TryFrom<ComparisonLeg> for Itinerary {
    type Error = SearchError;

    fn try_from(leg: ComparisonLeg) -> Result<Self, Self::Error> {
        if leg.segments.is_empty() {
            return Err(SearchError::Normalization("leg has no segments".to_string()));
        }
        let segments = leg
            .segments
            .into_iter()
            .map(Segment::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let declared = leg
            .duration_in_minutes
            .map(|minutes| declared_duration(minutes, 60, "durationInMinutes"))
            .transpose()?;
        Ok(Itinerary::new(segments, declared))
    }
}

// Prices come without a currency; they are quoted in the one requested
fn normalize_itinerary(
    itinerary: ComparisonItinerary,
    currency: &str,
) -> Result<UnifiedFlightOffer, SearchError> {
    let id = itinerary.id.as_deref().unwrap_or("?").to_string();
    let raw = itinerary
        .price
        .and_then(|price| price.raw)
        .ok_or_else(|| SearchError::Normalization(format!("itinerary {} has no price", id)))?;
    if itinerary.legs.is_empty() {
        return Err(SearchError::Normalization(format!("itinerary {} has no legs", id)));
    }

    Ok(UnifiedFlightOffer {
        provider: PROVIDER_NAME.to_string(),
        offer_ref: itinerary.id,
        price: Money::new(parse_amount(&raw, "price.raw")?, currency),
        itineraries: itinerary
            .legs
            .into_iter()
            .map(Itinerary::try_from)
            .collect::<Result<Vec<_>, _>>()?,
    })
}

fn normalize_response(
    response: ComparisonResponse,
    params: &UnifiedSearchParameters,
) -> Result<Vec<UnifiedFlightOffer>, SearchError> {
    if !response.status {
        let detail = match response.message {
            Some(serde_json::Value::String(message)) => message,
            Some(other) => other.to_string(),
            None => "vendor reported failure".to_string(),
        };
        return Err(SearchError::ProviderApi { status: 200, detail });
    }

    let data = response
        .data
        .ok_or_else(|| SearchError::Normalization("response has no data".to_string()))?;
    data.itineraries
        .into_iter()
        .map(|itinerary| normalize_itinerary(itinerary, &params.currency))
        .collect()
}

fn cabin_class(cabin: CabinClass) -> &'static str {
    match cabin {
        CabinClass::Economy => "economy",
        CabinClass::PremiumEconomy => "premium_economy",
        CabinClass::Business => "business",
        CabinClass::First => "first",
    }
}

fn build_query(params: &UnifiedSearchParameters) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("originSkyId", params.origin.clone()),
        ("destinationSkyId", params.destination.clone()),
        ("date", params.departure_date.format("%Y-%m-%d").to_string()),
    ];
    if let Some(return_date) = params.return_date {
        query.push(("returnDate", return_date.format("%Y-%m-%d").to_string()));
    }
    query.push(("adults", params.passengers.adults.to_string()));
    if params.passengers.children > 0 {
        query.push(("childrens", params.passengers.children.to_string()));
    }
    if params.passengers.infants > 0 {
        query.push(("infants", params.passengers.infants.to_string()));
    }
    if let Some(cabin) = params.cabin_class {
        query.push(("cabinClass", cabin_class(cabin).to_string()));
    }
    query.push(("currency", params.currency.clone()));
    if params.non_stop {
        query.push(("stops", "direct".to_string()));
    }
    query
}

pub struct ComparisonProvider {
    search_url: String,
    headers: HeaderMap,
    transport: HttpTransport,
}

impl ComparisonProvider {
    pub fn new(config: ComparisonConfig, transport: HttpTransport) -> Result<Self, SearchError> {
        if config.base_url.trim().is_empty() {
            return Err(SearchError::Configuration(format!("{} base_url is missing", PROVIDER_NAME)));
        }
        if config.api_key.trim().is_empty() {
            return Err(SearchError::Configuration(format!("{} api_key is missing", PROVIDER_NAME)));
        }

        Ok(Self {
            search_url: format!("{}/flights/search", config.base_url.trim_end_matches('/')),
            headers: api_key_headers(&config.api_key_header, &config.api_key)?,
            transport,
        })
    }

    #[instrument(skip_all, fields(provider = PROVIDER_NAME))]
    async fn search(
        &self,
        params: &UnifiedSearchParameters,
        cancel: &CancellationToken,
    ) -> Result<UnifiedFlightSearchResponse, SearchError> {
        let query = build_query(params);
        let body: ComparisonResponse = self
            .transport
            .get_json(&self.search_url, &query, self.headers.clone(), cancel)
            .await?;

        let mut offers = normalize_response(body, params)?;
        let total = offers.len();
        offers.retain(|offer| params.accepts(offer));
        debug!(dropped = total - offers.len(), "applied client-side filters");
        if let Some(limit) = params.max_results {
            offers.truncate(limit as usize);
        }

        info!(offers = offers.len(), "normalized vendor offers");
        Ok(UnifiedFlightSearchResponse::new(offers))
    }
}

#[async_trait]
impl FlightProvider for ComparisonProvider {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn search_flights(
        &self,
        params: &UnifiedSearchParameters,
        cancel: &CancellationToken,
    ) -> Result<UnifiedFlightSearchResponse, ProviderError> {
        self.search(params, cancel)
            .await
            .map_err(|source| ProviderError::new(PROVIDER_NAME, source))
    }
}
