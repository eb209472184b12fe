use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One row of source data: an ordered column → value mapping. Records are
/// immutable once built; resolution derives associations from them but never
/// writes back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Record {
    fields: Vec<(String, String)>,
}

impl Record {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Trimmed value for an exact column name; empty values read as absent.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    /// Accepts only finite values inside geographic range; everything else
    /// (NaN from a malformed payload, a `lat=999` candidate) is rejected so
    /// it degrades to a no-match upstream.
    pub fn validated(lat: f64, lon: f64) -> Option<Self> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        Some(Self { lat, lon })
    }
}

/// How a marker's coordinate was obtained. Downstream consumers match on
/// this exhaustively, so new strategies must extend the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    ExplicitField,
    ExternalLink,
    GeocodedName,
    GeocodedCountry,
    PredefinedCountry,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::ExplicitField => "explicit_field",
            ResolutionSource::ExternalLink => "external_link",
            ResolutionSource::GeocodedName => "geocoded_name",
            ResolutionSource::GeocodedCountry => "geocoded_country",
            ResolutionSource::PredefinedCountry => "predefined_country",
        }
    }

    /// True when producing this outcome never touches the network.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ResolutionSource::ExplicitField | ResolutionSource::ExternalLink
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// No name, country, coordinate, or link field was present.
    MissingFields,
    /// Every fallback step ran and none produced a coordinate.
    AllStrategiesMissed,
}

impl UnresolvedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnresolvedReason::MissingFields => "missing_fields",
            UnresolvedReason::AllStrategiesMissed => "all_strategies_missed",
        }
    }
}

/// A displayable result: one marker per resolved entity. Multi-entity name
/// fields produce several markers sharing the same source record.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedMarker {
    pub record: Arc<Record>,
    pub label: String,
    pub coordinate: Coordinate,
    pub source: ResolutionSource,
}

/// Canonical form used both as cache key and as the text sent to the
/// geocoding service: internal whitespace collapsed, trimmed, lowercased.
pub fn normalize_key(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(Coordinate::validated(999.0, 0.0).is_none());
        assert!(Coordinate::validated(0.0, -181.0).is_none());
        assert!(Coordinate::validated(f64::NAN, 0.0).is_none());
        assert!(Coordinate::validated(-33.45, -70.66).is_some());
    }

    #[test]
    fn normalizes_spacing_and_case_to_one_key() {
        assert_eq!(
            normalize_key("  Universidad   de\nChile "),
            normalize_key("universidad de chile")
        );
    }

    #[test]
    fn record_get_trims_and_skips_empty() {
        let record = Record::from_pairs([("Nombre", "  Foo  "), ("País", "   ")]);
        assert_eq!(record.get("Nombre"), Some("Foo"));
        assert_eq!(record.get("País"), None);
        assert_eq!(record.get("missing"), None);
    }
}
