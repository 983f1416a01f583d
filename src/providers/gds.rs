// Contract GDS adapter (OAuth client credentials, flight-offers search)

use super::{
    authorized_get, comma_joined, declared_duration, parse_amount, parse_vendor_timestamp,
    FlightProvider,
};
use crate::error::{ProviderError, SearchError};
use crate::model::{
    CabinClass, FlightPoint, Itinerary, Money, Segment, UnifiedFlightOffer,
    UnifiedFlightSearchResponse, UnifiedSearchParameters,
};
use crate::token::{AccessTokenCache, ClientCredentials};
use crate::transport::HttpTransport;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub const PROVIDER_NAME: &str = "gds";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GdsConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

// Vendor response
#[derive(Debug, Deserialize)]
struct GdsResponse {
    #[serde(default)]
    data: Vec<GdsOffer>,
}

#[derive(Debug, Deserialize)]
struct GdsOffer {
    id: Option<String>,
    price: Option<GdsPrice>,
    #[serde(default)]
    itineraries: Vec<GdsItinerary>,
}

#[derive(Debug, Deserialize)]
struct GdsPrice {
    currency: Option<String>,
    #[serde(rename = "grandTotal")]
    grand_total: Option<serde_json::Value>,
    total: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GdsItinerary {
    duration: Option<String>,
    #[serde(default)]
    segments: Vec<GdsSegment>,
}

#[derive(Debug, Deserialize)]
struct GdsSegment {
    departure: GdsEndpoint,
    arrival: GdsEndpoint,
    #[serde(rename = "carrierCode")]
    carrier_code: String,
    number: String,
    operating: Option<GdsOperating>,
}

#[derive(Debug, Deserialize)]
struct GdsEndpoint {
    #[serde(rename = "iataCode")]
    iata_code: String,
    at: String,
}

#[derive(Debug, Deserialize)]
struct GdsOperating {
    #[serde(rename = "carrierCode")]
    carrier_code: Option<String>,
}

impl TryFrom<GdsEndpoint> for FlightPoint {
    type Error = SearchError;

    fn try_from(endpoint: GdsEndpoint) -> Result<Self, Self::Error> {
        Ok(FlightPoint {
            at: parse_vendor_timestamp(&endpoint.at)?,
            airport: endpoint.iata_code,
        })
    }
}

impl TryFrom<GdsSegment> for Segment {
    type Error = SearchError;

    fn try_from(segment: GdsSegment) -> Result<Self, Self::Error> {
        Ok(Segment {
            carrier_code: segment.carrier_code,
            operating_carrier: segment.operating.and_then(|operating| operating.carrier_code),
            flight_number: segment.number,
            departure: segment.departure.try_into()?,
            arrival: segment.arrival.try_into()?,
        })
    }
}

impl TryFrom<GdsItinerary> for Itinerary {
    type Error = SearchError;

    fn try_from(itinerary: GdsItinerary) -> Result<Self, Self::Error> {
        if itinerary.segments.is_empty() {
            return Err(SearchError::Normalization("itinerary has no segments".to_string()));
        }
        let declared = itinerary
            .duration
            .as_deref()
            .map(parse_iso_duration)
            .transpose()?;
        let segments = itinerary
            .segments
            .into_iter()
            .map(Segment::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Itinerary::new(segments, declared))
    }
}

impl TryFrom<GdsOffer> for UnifiedFlightOffer {
    type Error = SearchError;

    fn try_from(offer: GdsOffer) -> Result<Self, Self::Error> {
        let offer_id = offer.id.as_deref().unwrap_or("?").to_string();
        let price = offer
            .price
            .ok_or_else(|| SearchError::Normalization(format!("offer {} has no price", offer_id)))?;
        let currency = price
            .currency
            .ok_or_else(|| SearchError::Normalization(format!("offer {} has no currency", offer_id)))?;
        // grandTotal includes fees; total is the fallback
        let amount = price
            .grand_total
            .or(price.total)
            .ok_or_else(|| SearchError::Normalization(format!("offer {} has no total", offer_id)))?;

        if offer.itineraries.is_empty() {
            return Err(SearchError::Normalization(format!(
                "offer {} has no itineraries",
                offer_id
            )));
        }

        Ok(UnifiedFlightOffer {
            provider: PROVIDER_NAME.to_string(),
            offer_ref: offer.id,
            price: Money::new(parse_amount(&amount, "grandTotal")?, &currency),
            itineraries: offer
                .itineraries
                .into_iter()
                .map(Itinerary::try_from)
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

// ISO-8601 durations such as PT7H5M or P1DT2H
fn parse_iso_duration(value: &str) -> Result<chrono::Duration, SearchError> {
    let invalid = || SearchError::Normalization(format!("invalid ISO-8601 duration '{}'", value));
    let rest = value.strip_prefix('P').ok_or_else(invalid)?;

    let mut seconds: i64 = 0;
    let mut number = String::new();
    let mut in_time = false;
    let mut saw_component = false;
    for c in rest.chars() {
        match c {
            'T' if !in_time && number.is_empty() => in_time = true,
            '0'..='9' => number.push(c),
            unit => {
                let amount: i64 = number.parse().map_err(|_| invalid())?;
                number.clear();
                let scale = match (in_time, unit) {
                    (false, 'D') => 86_400,
                    (true, 'H') => 3_600,
                    (true, 'M') => 60,
                    (true, 'S') => 1,
                    _ => return Err(invalid()),
                };
                seconds = amount
                    .checked_mul(scale)
                    .and_then(|component| seconds.checked_add(component))
                    .ok_or_else(invalid)?;
                saw_component = true;
            }
        }
    }

    if !number.is_empty() || !saw_component {
        return Err(invalid());
    }
    declared_duration(seconds, 1, "duration")
}

fn travel_class(cabin: CabinClass) -> &'static str {
    match cabin {
        CabinClass::Economy => "ECONOMY",
        CabinClass::PremiumEconomy => "PREMIUM_ECONOMY",
        CabinClass::Business => "BUSINESS",
        CabinClass::First => "FIRST",
    }
}

fn build_query(params: &UnifiedSearchParameters) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("originLocationCode", params.origin.clone()),
        ("destinationLocationCode", params.destination.clone()),
        ("departureDate", params.departure_date.format("%Y-%m-%d").to_string()),
        ("adults", params.passengers.adults.to_string()),
    ];

    if let Some(return_date) = params.return_date {
        query.push(("returnDate", return_date.format("%Y-%m-%d").to_string()));
    }
    if params.passengers.children > 0 {
        query.push(("children", params.passengers.children.to_string()));
    }
    if params.passengers.infants > 0 {
        query.push(("infants", params.passengers.infants.to_string()));
    }
    if let Some(cabin) = params.cabin_class {
        query.push(("travelClass", travel_class(cabin).to_string()));
    }
    if let Some(included) = comma_joined(&params.included_carriers) {
        query.push(("includedAirlineCodes", included));
    }
    if let Some(excluded) = comma_joined(&params.excluded_carriers) {
        query.push(("excludedAirlineCodes", excluded));
    }
    if params.non_stop {
        query.push(("nonStop", "true".to_string()));
    }
    query.push(("currencyCode", params.currency.clone()));
    if let Some(max_price) = params.max_price {
        // Only whole currency units are accepted
        query.push(("maxPrice", max_price.ceil().to_string()));
    }
    if let Some(max_results) = params.max_results {
        query.push(("max", max_results.to_string()));
    }
    query
}

pub struct GdsProvider {
    search_url: String,
    tokens: Arc<AccessTokenCache>,
    transport: HttpTransport,
}

impl GdsProvider {
    pub fn new(
        config: GdsConfig,
        tokens: Arc<AccessTokenCache>,
        transport: HttpTransport,
    ) -> Result<Self, SearchError> {
        if config.base_url.trim().is_empty() {
            return Err(SearchError::Configuration(format!("{} base_url is missing", PROVIDER_NAME)));
        }
        tokens.register(
            PROVIDER_NAME,
            ClientCredentials {
                token_url: config.token_url,
                client_id: config.client_id,
                client_secret: config.client_secret,
            },
        )?;

        Ok(Self {
            search_url: format!("{}/v2/shopping/flight-offers", config.base_url.trim_end_matches('/')),
            tokens,
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
        let body: GdsResponse = authorized_get(
            &self.tokens,
            &self.transport,
            PROVIDER_NAME,
            &self.search_url,
            &query,
            cancel,
        )
        .await?;

        let offers = body
            .data
            .into_iter()
            .map(UnifiedFlightOffer::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        info!(offers = offers.len(), "normalized vendor offers");
        Ok(UnifiedFlightSearchResponse::new(offers))
    }
}

#[async_trait]
impl FlightProvider for GdsProvider {
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
