use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};

use crate::query::Query;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct City {
    pub name: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: u64,
    pub email: String,
    pub newsletter: String,
    pub city: City,
    #[serde(default = "default_subscribed")]
    pub subscribed: bool,
}

fn default_subscribed() -> bool {
    true
}

/// Grouping key for subscribers sharing one weather lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationKey {
    pub city: String,
    pub state: String,
}

impl LocationKey {
    pub fn query(&self) -> Query {
        Query::city_state(&self.city, &self.state)
    }
}

impl From<&City> for LocationKey {
    fn from(city: &City) -> Self {
        Self {
            city: city.name.clone(),
            state: city.state.clone(),
        }
    }
}

impl std::fmt::Display for LocationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, {}", self.city, self.state)
    }
}

/// One notification actually handed to the mailer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub subscriber_id: u64,
    pub recipient: String,
    pub sender: String,
    pub newsletter: String,
    pub subject: String,
    pub date_sent: DateTime<Utc>,
}

/// Outgoing HTML message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

/// `current_observation` section of the `conditions` feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    pub weather: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub feelslike_f: f64,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub temp_f: Option<f64>,
    #[serde(default)]
    pub relative_humidity: Option<String>,
    #[serde(default)]
    pub observation_time: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConditionsResponse {
    pub current_observation: Conditions,
}

/// Seasonal normals from the `almanac` feature, in Fahrenheit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Almanac {
    pub avg_high_f: f64,
    pub avg_low_f: f64,
}

impl Almanac {
    pub fn average(&self) -> f64 {
        (self.avg_low_f + self.avg_high_f) / 2.0
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct AlmanacResponse {
    pub almanac: RawAlmanac,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawAlmanac {
    temp_high: RawTemperature,
    temp_low: RawTemperature,
}

#[derive(Debug, Deserialize)]
struct RawTemperature {
    normal: RawReading,
}

#[derive(Debug, Deserialize)]
struct RawReading {
    #[serde(rename = "F", deserialize_with = "lenient_f64")]
    fahrenheit: f64,
}

impl From<RawAlmanac> for Almanac {
    fn from(raw: RawAlmanac) -> Self {
        Self {
            avg_high_f: raw.temp_high.normal.fahrenheit,
            avg_low_f: raw.temp_low.normal.fahrenheit,
        }
    }
}

// The provider sends some numbers as JSON strings ("66.3") and others bare.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(f64),
    Text(String),
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("expected a number, got {s:?}"))),
    }
}

fn lenient_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::Text(s)) => Ok(s.trim().parse().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conditions_accept_string_and_number_temperatures() {
        let raw = json!({
            "current_observation": {
                "weather": "Overcast",
                "feelslike_f": "66.3",
                "temp_f": 66.3,
                "relative_humidity": "65%"
            }
        });
        let parsed: ConditionsResponse = serde_json::from_value(raw).unwrap();
        let c = parsed.current_observation;
        assert_eq!(c.weather, "Overcast");
        assert_eq!(c.feelslike_f, 66.3);
        assert_eq!(c.temp_f, Some(66.3));
    }

    #[test]
    fn conditions_reject_garbage_feelslike() {
        let raw = json!({ "current_observation": { "weather": "Clear", "feelslike_f": "n/a" } });
        assert!(serde_json::from_value::<ConditionsResponse>(raw).is_err());
    }

    #[test]
    fn almanac_average_of_normals() {
        let raw = json!({
            "almanac": {
                "airport_code": "KBOS",
                "temp_high": { "normal": { "F": "71", "C": "22" }, "record": { "F": "90" } },
                "temp_low": { "normal": { "F": "55", "C": "13" } }
            }
        });
        let parsed: AlmanacResponse = serde_json::from_value(raw).unwrap();
        let almanac = Almanac::from(parsed.almanac);
        assert_eq!(almanac.avg_high_f, 71.0);
        assert_eq!(almanac.average(), 63.0);
    }

    #[test]
    fn subscriber_defaults_to_subscribed() {
        let raw = json!({
            "id": 7,
            "email": "a@example.com",
            "newsletter": "WD",
            "city": { "name": "Boston", "state": "MA" }
        });
        let s: Subscriber = serde_json::from_value(raw).unwrap();
        assert!(s.subscribed);
        assert_eq!(LocationKey::from(&s.city).to_string(), "Boston, MA");
    }
}
