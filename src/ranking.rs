// Ordering of a merged offer set. Ranking never changes an offer, only its position.

use crate::model::{UnifiedFlightOffer, UnifiedFlightSearchResponse};
use chrono::NaiveDateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Price,
    Duration,
    Departure,
    Arrival,
    Stops,
    Airline,
    Overall,
}

impl SortKey {
    // Anything unrecognised sorts by price
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "duration" => SortKey::Duration,
            "departure" => SortKey::Departure,
            "arrival" => SortKey::Arrival,
            "stops" => SortKey::Stops,
            "airline" => SortKey::Airline,
            "overall" => SortKey::Overall,
            _ => SortKey::Price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("desc") {
            SortDirection::Descending
        } else {
            SortDirection::Ascending
        }
    }
}

// Weights and normalization baselines of the overall score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingWeights {
    pub price: f64,
    pub duration: f64,
    pub stops: f64,
    pub price_baseline: f64,
    pub duration_baseline_hours: f64,
    pub stops_baseline: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            price: 0.5,
            duration: 0.3,
            stops: 0.2,
            price_baseline: 1000.0,
            duration_baseline_hours: 24.0,
            stops_baseline: 3.0,
        }
    }
}

// f64 with a total order so scores can be sorted like any other key
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RankingEngine {
    weights: RankingWeights,
}

impl RankingEngine {
    pub fn new(weights: RankingWeights) -> Self {
        Self { weights }
    }

    pub fn rank(&self, response: &mut UnifiedFlightSearchResponse, sort_by: &str, direction: &str) {
        self.rank_by(response, SortKey::parse(sort_by), SortDirection::parse(direction));
    }

    pub fn rank_by(
        &self,
        response: &mut UnifiedFlightSearchResponse,
        key: SortKey,
        direction: SortDirection,
    ) {
        if response.is_empty() {
            return;
        }
        debug!(?key, ?direction, offers = response.len(), "ranking offers");

        let offers = &mut response.offers;
        match key {
            SortKey::Price => sort_offers(offers, direction, |offer| offer.price.amount),
            SortKey::Duration => sort_offers(offers, direction, |offer| {
                offer.first_itinerary().map_or(0, |itinerary| itinerary.duration_minutes())
            }),
            SortKey::Departure => sort_offers(offers, direction, |offer| {
                offer
                    .first_itinerary()
                    .and_then(|itinerary| itinerary.first_departure())
                    .map_or(NaiveDateTime::MIN, |point| point.at)
            }),
            SortKey::Arrival => sort_offers(offers, direction, |offer| {
                offer
                    .first_itinerary()
                    .and_then(|itinerary| itinerary.last_arrival())
                    .map_or(NaiveDateTime::MIN, |point| point.at)
            }),
            SortKey::Stops => sort_offers(offers, direction, |offer| {
                offer.first_itinerary().map_or(0, |itinerary| itinerary.stops())
            }),
            SortKey::Airline => sort_offers(offers, direction, |offer| {
                offer
                    .first_itinerary()
                    .and_then(|itinerary| itinerary.segments().first())
                    .map(|segment| segment.carrier_code.clone())
                    .unwrap_or_default()
            }),
            SortKey::Overall => {
                sort_offers(offers, direction, |offer| Score(self.overall_score(offer)))
            }
        }
    }

    // Lower is better. An offer without itineraries gets the worst score.
    pub fn overall_score(&self, offer: &UnifiedFlightOffer) -> f64 {
        let Some(itinerary) = offer.first_itinerary() else {
            return f64::MAX;
        };
        let w = &self.weights;
        let price = decimal_to_f64(offer.price.amount);

        w.price * (price / w.price_baseline)
            + w.duration * (itinerary.duration_hours() / w.duration_baseline_hours)
            + w.stops * (itinerary.stops() as f64 / w.stops_baseline)
    }
}

fn decimal_to_f64(amount: Decimal) -> f64 {
    amount.to_f64().unwrap_or(f64::MAX)
}

// Keys are computed once per offer; sort_by is stable, so ties keep their input order
// in both directions.
fn sort_offers<K, F>(offers: &mut Vec<UnifiedFlightOffer>, direction: SortDirection, key: F)
where
    K: Ord,
    F: Fn(&UnifiedFlightOffer) -> K,
{
    let mut keyed: Vec<(K, UnifiedFlightOffer)> =
        offers.drain(..).map(|offer| (key(&offer), offer)).collect();
    keyed.sort_by(|(a, _), (b, _)| match direction {
        SortDirection::Ascending => a.cmp(b),
        SortDirection::Descending => b.cmp(a),
    });
    offers.extend(keyed.into_iter().map(|(_, offer)| offer));
}
