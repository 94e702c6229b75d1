use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A point of interest identified for a free-text query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub coordinates: Coordinates,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    pub fn distance_degrees(&self, other: &Coordinates) -> f64 {
        (self.latitude - other.latitude)
            .abs()
            .max((self.longitude - other.longitude).abs())
    }
}

impl Location {
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::malformed_output_error("location without a name"));
        }

        if !self.coordinates.is_valid() {
            return Err(Error::malformed_output_error(format!(
                "coordinates out of range for {}",
                self.name
            )));
        }

        Ok(())
    }
}

/// Rejects the whole batch if any single record is malformed.
pub fn validate_all(locations: &[Location]) -> Result<(), Error> {
    locations.iter().try_for_each(Location::validate)
}

#[cfg(test)]
pub fn sample(name: &str, latitude: f64, longitude: f64) -> Location {
    Location {
        name: name.into(),
        address: "".into(),
        city: "Paris".into(),
        state: "Île-de-France".into(),
        country: "France".into(),
        coordinates: Coordinates::new(latitude, longitude),
    }
}

#[test]
fn coordinates_range() {
    assert!(Coordinates::new(48.8584, 2.2945).is_valid());
    assert!(Coordinates::new(-90.0, 180.0).is_valid());
    assert!(!Coordinates::new(90.5, 0.0).is_valid());
    assert!(!Coordinates::new(0.0, -180.1).is_valid());
    assert!(!Coordinates::new(f64::NAN, 0.0).is_valid());
    assert!(!Coordinates::new(0.0, f64::INFINITY).is_valid());
}

#[test]
fn one_bad_record_rejects_batch() {
    let good = sample("Eiffel Tower", 48.8584, 2.2945);
    let bad = sample("Nowhere", 123.0, 2.0);

    assert!(validate_all(&[good.clone()]).is_ok());
    assert!(validate_all(&[]).is_ok());

    let err = validate_all(&[good, bad]).unwrap_err();
    assert!(err.is_malformed_output_error());
}

#[test]
fn missing_field_fails_deserialization() {
    let value = serde_json::json!({
        "name": "Louvre Museum",
        "address": "Rue de Rivoli",
        "city": "Paris",
        "country": "France",
        "coordinates": { "latitude": 48.8606, "longitude": 2.3376 }
    });

    assert!(serde_json::from_value::<Location>(value).is_err());
}
