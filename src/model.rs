// Unified schema every provider adapter normalizes into

use crate::error::AggregationError;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CabinClass {
    Economy,
    PremiumEconomy,
    Business,
    First,
}

impl FromStr for CabinClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "economy" => Ok(CabinClass::Economy),
            "premiumeconomy" => Ok(CabinClass::PremiumEconomy),
            "business" => Ok(CabinClass::Business),
            "first" => Ok(CabinClass::First),
            _ => Err(format!("unknown cabin class '{}'", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passengers {
    pub adults: u8,
    pub children: u8,
    pub infants: u8,
}

impl Default for Passengers {
    fn default() -> Self {
        Self {
            adults: 1,
            children: 0,
            infants: 0,
        }
    }
}

// Built once by the caller; every adapter task receives its own copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedSearchParameters {
    pub origin: String,
    pub destination: String,
    pub departure_date: NaiveDate,
    pub return_date: Option<NaiveDate>,
    pub passengers: Passengers,
    pub cabin_class: Option<CabinClass>,
    pub included_carriers: BTreeSet<String>,
    pub excluded_carriers: BTreeSet<String>,
    pub non_stop: bool,
    pub currency: String,
    pub max_price: Option<Decimal>,
    pub max_results: Option<u32>,
}

impl UnifiedSearchParameters {
    pub fn new(origin: &str, destination: &str, departure_date: NaiveDate) -> Self {
        Self {
            origin: origin.to_ascii_uppercase(),
            destination: destination.to_ascii_uppercase(),
            departure_date,
            return_date: None,
            passengers: Passengers::default(),
            cabin_class: None,
            included_carriers: BTreeSet::new(),
            excluded_carriers: BTreeSet::new(),
            non_stop: false,
            currency: "USD".to_string(),
            max_price: None,
            max_results: None,
        }
    }

    #[must_use]
    pub fn with_return_date(mut self, return_date: NaiveDate) -> Self {
        self.return_date = Some(return_date);
        self
    }

    #[must_use]
    pub fn with_passengers(mut self, adults: u8, children: u8, infants: u8) -> Self {
        self.passengers = Passengers {
            adults,
            children,
            infants,
        };
        self
    }

    #[must_use]
    pub fn with_cabin_class(mut self, cabin_class: CabinClass) -> Self {
        self.cabin_class = Some(cabin_class);
        self
    }

    #[must_use]
    pub fn with_included_carriers<I, S>(mut self, carriers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.included_carriers = normalize_codes(carriers);
        self
    }

    #[must_use]
    pub fn with_excluded_carriers<I, S>(mut self, carriers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.excluded_carriers = normalize_codes(carriers);
        self
    }

    #[must_use]
    pub fn with_non_stop(mut self, non_stop: bool) -> Self {
        self.non_stop = non_stop;
        self
    }

    #[must_use]
    pub fn with_currency(mut self, currency: &str) -> Self {
        self.currency = currency.to_ascii_uppercase();
        self
    }

    #[must_use]
    pub fn with_max_price(mut self, max_price: Decimal) -> Self {
        self.max_price = Some(max_price);
        self
    }

    #[must_use]
    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn is_round_trip(&self) -> bool {
        self.return_date.is_some()
    }

    // Rejects parameters no vendor could answer meaningfully
    pub fn validate(&self) -> Result<(), AggregationError> {
        let invalid = |message: String| Err(AggregationError::InvalidRequest(message));

        for (field, code) in [("origin", &self.origin), ("destination", &self.destination)] {
            if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return invalid(format!("{} must be an alphabetic location code, got '{}'", field, code));
            }
        }
        if self.origin == self.destination {
            return invalid("origin and destination must differ".to_string());
        }
        if let Some(return_date) = self.return_date {
            if return_date < self.departure_date {
                return invalid(format!(
                    "return date {} is before departure date {}",
                    return_date, self.departure_date
                ));
            }
        }
        if self.passengers.adults == 0 {
            return invalid("at least one adult passenger is required".to_string());
        }
        if self.passengers.infants > self.passengers.adults {
            return invalid("each infant must travel with an adult".to_string());
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return invalid(format!("currency must be an ISO 4217 code, got '{}'", self.currency));
        }
        if let Some(max_price) = self.max_price {
            if max_price <= Decimal::ZERO {
                return invalid(format!("max price must be positive, got {}", max_price));
            }
        }
        if let Some(carrier) = self
            .included_carriers
            .intersection(&self.excluded_carriers)
            .next()
        {
            return invalid(format!("carrier {} is both included and excluded", carrier));
        }
        Ok(())
    }

    // Client-side check of the filters a vendor may have ignored.
    // Prices in another currency are not compared.
    pub fn accepts(&self, offer: &UnifiedFlightOffer) -> bool {
        if let Some(max_price) = self.max_price {
            if offer.price.currency == self.currency && offer.price.amount > max_price {
                return false;
            }
        }
        if self.non_stop && !offer.is_non_stop() {
            return false;
        }
        if !self.included_carriers.is_empty()
            && !offer
                .marketing_carriers()
                .all(|carrier| self.included_carriers.contains(carrier))
        {
            return false;
        }
        !offer
            .marketing_carriers()
            .any(|carrier| self.excluded_carriers.contains(carrier))
    }
}

fn normalize_codes<I, S>(codes: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    codes
        .into_iter()
        .map(|code| code.as_ref().trim().to_ascii_uppercase())
        .filter(|code| !code.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: String,
}

impl Money {
    pub fn new(amount: Decimal, currency: &str) -> Self {
        Self {
            amount,
            currency: currency.to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightPoint {
    pub airport: String,
    pub at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub carrier_code: String,
    pub operating_carrier: Option<String>,
    pub flight_number: String,
    pub departure: FlightPoint,
    pub arrival: FlightPoint,
}

impl Segment {
    pub fn duration(&self) -> Duration {
        self.arrival.at - self.departure.at
    }
}

// Segments are kept in the order the vendor reported them; there is no way to reorder
// them once the itinerary is built, since duration and stop count are derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Itinerary {
    segments: Vec<Segment>,
    duration_minutes: i64,
    stops: usize,
}

impl Itinerary {
    // A declared duration wins over the one computed from segment timestamps
    pub fn new(segments: Vec<Segment>, declared_duration: Option<Duration>) -> Self {
        let duration = declared_duration.unwrap_or_else(|| match (segments.first(), segments.last()) {
            (Some(first), Some(last)) => last.arrival.at - first.departure.at,
            _ => Duration::zero(),
        });

        Self {
            stops: segments.len().saturating_sub(1),
            duration_minutes: duration.num_minutes(),
            segments,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn stops(&self) -> usize {
        self.stops
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes)
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration_minutes
    }

    pub fn duration_hours(&self) -> f64 {
        self.duration_minutes as f64 / 60.0
    }

    pub fn first_departure(&self) -> Option<&FlightPoint> {
        self.segments.first().map(|segment| &segment.departure)
    }

    pub fn last_arrival(&self) -> Option<&FlightPoint> {
        self.segments.last().map(|segment| &segment.arrival)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedFlightOffer {
    pub provider: String,
    pub offer_ref: Option<String>,
    pub price: Money,
    pub itineraries: Vec<Itinerary>,
}

impl UnifiedFlightOffer {
    pub fn first_itinerary(&self) -> Option<&Itinerary> {
        self.itineraries.first()
    }

    pub fn marketing_carriers(&self) -> impl Iterator<Item = &str> {
        self.itineraries
            .iter()
            .flat_map(|itinerary| itinerary.segments().iter())
            .map(|segment| segment.carrier_code.as_str())
    }

    pub fn is_non_stop(&self) -> bool {
        self.itineraries.iter().all(|itinerary| itinerary.stops() == 0)
    }
}

// Insertion order until ranked, ranking order afterwards
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnifiedFlightSearchResponse {
    pub offers: Vec<UnifiedFlightOffer>,
}

impl UnifiedFlightSearchResponse {
    pub fn new(offers: Vec<UnifiedFlightOffer>) -> Self {
        Self { offers }
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    pub fn merge(&mut self, other: UnifiedFlightSearchResponse) {
        self.offers.extend(other.offers);
    }
}
