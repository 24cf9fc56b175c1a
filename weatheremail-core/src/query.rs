use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Location descriptor for a provider request.
///
/// Several variants may be filled at once; [`Query::resolve`] picks one in
/// fixed order: coordinates, zipcode, airport code, city + state,
/// city + country.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub zipcode: Option<String>,
    pub airportcode: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

impl Query {
    pub fn coordinates(latitude: f64, longitude: f64) -> Self {
        Self::default().with_coordinates(latitude, longitude)
    }

    pub fn zipcode(zipcode: impl Into<String>) -> Self {
        Self::default().with_zipcode(zipcode)
    }

    pub fn airport(code: impl Into<String>) -> Self {
        Self::default().with_airportcode(code)
    }

    pub fn city_state(city: impl Into<String>, state: impl Into<String>) -> Self {
        Self::default().with_city(city).with_state(state)
    }

    pub fn city_country(city: impl Into<String>, country: impl Into<String>) -> Self {
        Self::default().with_city(city).with_country(country)
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn with_zipcode(mut self, zipcode: impl Into<String>) -> Self {
        self.zipcode = Some(zipcode.into());
        self
    }

    pub fn with_airportcode(mut self, code: impl Into<String>) -> Self {
        self.airportcode = Some(code.into());
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Location segment placed between `/q/` and `.json`.
    pub fn resolve(&self) -> Result<String, ApiError> {
        if let (Some(lat), Some(lon)) = (self.latitude, self.longitude) {
            return Ok(format!("{lat},{lon}"));
        }
        if let Some(zip) = &self.zipcode {
            return Ok(zip.clone());
        }
        if let Some(code) = &self.airportcode {
            return Ok(code.clone());
        }
        if let (Some(city), Some(state)) = (&self.city, &self.state) {
            return Ok(format!("{state}/{city}"));
        }
        if let (Some(city), Some(country)) = (&self.city, &self.country) {
            return Ok(format!("{country}/{city}"));
        }

        Err(ApiError::Parameter)
    }
}

/// Feature options rendered as `key:value` path segments, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSettings(Vec<(String, String)>);

impl FeatureSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an option. Replacing keeps the original position.
    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let key = key.into();
        let value = value.to_string();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_path(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for FeatureSettings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |settings, (k, v)| settings.set(k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zipcode_wins_over_city_state() {
        let q = Query::city_state("Boston", "MA").with_zipcode("02110");
        assert_eq!(q.resolve().unwrap(), "02110");
    }

    #[test]
    fn coordinates_win_over_everything() {
        let q = Query::zipcode("02110")
            .with_airportcode("KBOS")
            .with_coordinates(42.36, -71.06);
        assert_eq!(q.resolve().unwrap(), "42.36,-71.06");
    }

    #[test]
    fn half_coordinates_fall_through() {
        let mut q = Query::airport("KBOS");
        q.latitude = Some(42.0);
        assert_eq!(q.resolve().unwrap(), "KBOS");
    }

    #[test]
    fn city_state_before_city_country() {
        let q = Query::city_state("Paris", "TX").with_country("France");
        assert_eq!(q.resolve().unwrap(), "TX/Paris");

        let q = Query::city_country("Paris", "France");
        assert_eq!(q.resolve().unwrap(), "France/Paris");
    }

    #[test]
    fn unresolvable_query_is_parameter_error() {
        let q = Query::default().with_city("Boston");
        assert!(q.resolve().unwrap_err().is_parameter());
        assert!(Query::default().resolve().is_err());
    }

    #[test]
    fn settings_keep_insertion_order() {
        let settings = FeatureSettings::new()
            .set("lang", "EN")
            .set("pws", 0)
            .set("bestfct", 1)
            .set("lang", "FR");
        assert_eq!(settings.to_path(), "lang:FR/pws:0/bestfct:1");
    }

    #[test]
    fn settings_from_pairs() {
        let settings: FeatureSettings = [("lang", "EN")].into_iter().collect();
        assert_eq!(settings.to_path(), "lang:EN");
        assert!(FeatureSettings::new().is_empty());
    }
}
