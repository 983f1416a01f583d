// Meta-search adapter, reached through a gateway that issues its own OAuth tokens

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

pub const PROVIDER_NAME: &str = "metasearch";

const DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetasearchConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct MetasearchResponse {
    currency: Option<String>,
    #[serde(default)]
    data: Vec<MetasearchOffer>,
}

#[derive(Debug, Deserialize)]
struct MetasearchOffer {
    id: Option<String>,
    price: Option<serde_json::Value>,
    duration: Option<MetasearchDuration>,
    #[serde(default)]
    route: Vec<MetasearchHop>,
}

// Seconds per direction
#[derive(Debug, Deserialize)]
struct MetasearchDuration {
    departure: Option<i64>,
    #[serde(rename = "return")]
    inbound: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MetasearchHop {
    #[serde(rename = "flyFrom")]
    fly_from: String,
    #[serde(rename = "flyTo")]
    fly_to: String,
    local_departure: String,
    local_arrival: String,
    airline: String,
    operating_carrier: Option<String>,
    flight_no: serde_json::Value,
    #[serde(rename = "return", default)]
    inbound: u8,
}

impl TryFrom<MetasearchHop> for Segment {
    type Error = SearchError;

    fn try_from(hop: MetasearchHop) -> Result<Self, Self::Error> {
        let flight_number = match hop.flight_no {
            serde_json::Value::Number(number) => number.to_string(),
            serde_json::Value::String(text) if !text.trim().is_empty() => text,
            other => {
                return Err(SearchError::Normalization(format!(
                    "hop {}-{} has no flight number: {}",
                    hop.fly_from, hop.fly_to, other
                )))
            }
        };

        Ok(Segment {
            carrier_code: hop.airline,
            // An empty operating carrier means the marketing carrier flies it
            operating_carrier: hop.operating_carrier.filter(|code| !code.trim().is_empty()),
            flight_number,
            departure: FlightPoint {
                airport: hop.fly_from,
                at: parse_vendor_timestamp(&hop.local_departure)?,
            },
            arrival: FlightPoint {
                airport: hop.fly_to,
                at: parse_vendor_timestamp(&hop.local_arrival)?,
            },
        })
    }
}

fn declared(seconds: Option<i64>) -> Result<Option<chrono::Duration>, SearchError> {
    match seconds {
        // Zero stands for a direction the offer does not fly
        None | Some(0) => Ok(None),
        Some(seconds) => declared_duration(seconds, 1, "duration").map(Some),
    }
}

// The vendor returns one flat route; the return flag splits it into outbound and inbound
fn normalize_offer(offer: MetasearchOffer, currency: &str) -> Result<UnifiedFlightOffer, SearchError> {
    let id = offer.id.as_deref().unwrap_or("?").to_string();
    let price = offer
        .price
        .ok_or_else(|| SearchError::Normalization(format!("offer {} has no price", id)))?;

    let (inbound, outbound): (Vec<MetasearchHop>, Vec<MetasearchHop>) =
        offer.route.into_iter().partition(|hop| hop.inbound == 1);
    if outbound.is_empty() {
        return Err(SearchError::Normalization(format!(
            "offer {} has no outbound route",
            id
        )));
    }

    let (outbound_duration, inbound_duration) = match offer.duration {
        Some(duration) => (declared(duration.departure)?, declared(duration.inbound)?),
        None => (None, None),
    };

    let mut itineraries = vec![Itinerary::new(
        outbound
            .into_iter()
            .map(Segment::try_from)
            .collect::<Result<Vec<_>, _>>()?,
        outbound_duration,
    )];
    if !inbound.is_empty() {
        itineraries.push(Itinerary::new(
            inbound
                .into_iter()
                .map(Segment::try_from)
                .collect::<Result<Vec<_>, _>>()?,
            inbound_duration,
        ));
    }

    Ok(UnifiedFlightOffer {
        provider: PROVIDER_NAME.to_string(),
        offer_ref: offer.id,
        price: Money::new(parse_amount(&price, "price")?, currency),
        itineraries,
    })
}

fn normalize_response(
    response: MetasearchResponse,
    params: &UnifiedSearchParameters,
) -> Result<Vec<UnifiedFlightOffer>, SearchError> {
    let currency = response
        .currency
        .unwrap_or_else(|| params.currency.clone());
    response
        .data
        .into_iter()
        .map(|offer| normalize_offer(offer, &currency))
        .collect()
}

fn selected_cabin(cabin: CabinClass) -> &'static str {
    match cabin {
        CabinClass::Economy => "M",
        CabinClass::PremiumEconomy => "W",
        CabinClass::Business => "C",
        CabinClass::First => "F",
    }
}

fn build_query(params: &UnifiedSearchParameters) -> Vec<(&'static str, String)> {
    let departure = params.departure_date.format(DATE_FORMAT).to_string();
    let mut query = vec![
        ("fly_from", params.origin.clone()),
        ("fly_to", params.destination.clone()),
        ("date_from", departure.clone()),
        ("date_to", departure),
    ];

    if let Some(return_date) = params.return_date {
        let inbound = return_date.format(DATE_FORMAT).to_string();
        query.push(("return_from", inbound.clone()));
        query.push(("return_to", inbound));
    }
    query.push(("adults", params.passengers.adults.to_string()));
    query.push(("children", params.passengers.children.to_string()));
    query.push(("infants", params.passengers.infants.to_string()));
    if let Some(cabin) = params.cabin_class {
        query.push(("selected_cabins", selected_cabin(cabin).to_string()));
    }

    // One carrier list per request; an include list wins and exclusions are filtered later
    if let Some(included) = comma_joined(&params.included_carriers) {
        query.push(("select_airlines", included));
    } else if let Some(excluded) = comma_joined(&params.excluded_carriers) {
        query.push(("select_airlines", excluded));
        query.push(("select_airlines_exclude", "true".to_string()));
    }

    if params.non_stop {
        query.push(("max_stopovers", "0".to_string()));
    }
    query.push(("curr", params.currency.clone()));
    if let Some(max_price) = params.max_price {
        query.push(("price_to", max_price.ceil().to_string()));
    }
    if let Some(limit) = params.max_results {
        query.push(("limit", limit.to_string()));
    }
    query
}

pub struct MetasearchProvider {
    search_url: String,
    tokens: Arc<AccessTokenCache>,
    transport: HttpTransport,
}

impl MetasearchProvider {
    pub fn new(
        config: MetasearchConfig,
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
            search_url: format!("{}/v2/search", config.base_url.trim_end_matches('/')),
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
        let body: MetasearchResponse = authorized_get(
            &self.tokens,
            &self.transport,
            PROVIDER_NAME,
            &self.search_url,
            &query,
            cancel,
        )
        .await?;

        let offers = normalize_response(body, params)?;
        info!(offers = offers.len(), "normalized vendor offers");
        Ok(UnifiedFlightSearchResponse::new(offers))
    }
}

#[async_trait]
impl FlightProvider for MetasearchProvider {
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
