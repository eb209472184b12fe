use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Url;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::debug;

use crate::cache::CoordinateCache;
use crate::config::FieldCandidates;
use crate::geocoder::GeocodeClient;
use crate::record::{
    normalize_key, Coordinate, Record, ResolutionSource, ResolvedMarker, UnresolvedReason,
};

/// Placeholder a sheet editor writes into the coordinate columns after a
/// lookup already failed once. Distinct from an empty cell: it means "do not
/// geocode this name again", so resolution jumps straight to the country
/// fallback.
pub const NOT_FOUND_SENTINEL: &str = "NOT FOUND";

/// Centroids for countries that appear in nearly every sheet. Matching one
/// of these avoids a network round-trip entirely. Keys are normalized and
/// accent-stripped; Spanish and English spellings are both listed.
const COUNTRY_CENTROIDS: &[(&str, f64, f64)] = &[
    ("alemania", 51.1657, 10.4515),
    ("argentina", -38.4161, -63.6167),
    ("bolivia", -16.2902, -63.5887),
    ("brasil", -14.235, -51.9253),
    ("brazil", -14.235, -51.9253),
    ("canada", 56.1304, -106.3468),
    ("chile", -35.6751, -71.543),
    ("china", 35.8617, 104.1954),
    ("colombia", 4.5709, -74.2973),
    ("costa rica", 9.7489, -83.7534),
    ("cuba", 21.5218, -77.7812),
    ("ecuador", -1.8312, -78.1834),
    ("espana", 40.4637, -3.7492),
    ("estados unidos", 37.0902, -95.7129),
    ("francia", 46.2276, 2.2137),
    ("france", 46.2276, 2.2137),
    ("germany", 51.1657, 10.4515),
    ("italia", 41.8719, 12.5674),
    ("italy", 41.8719, 12.5674),
    ("japan", 36.2048, 138.2529),
    ("japon", 36.2048, 138.2529),
    ("mexico", 23.6345, -102.5528),
    ("paraguay", -23.4425, -58.4438),
    ("peru", -9.19, -75.0152),
    ("portugal", 39.3999, -8.2245),
    ("reino unido", 55.3781, -3.436),
    ("spain", 40.4637, -3.7492),
    ("united kingdom", 55.3781, -3.436),
    ("united states", 37.0902, -95.7129),
    ("uruguay", -32.5228, -55.7658),
    ("venezuela", 6.4238, -66.5897),
];

/// Column names resolved once per batch from the header row, so per-record
/// work is a plain lookup instead of repeated header guessing.
#[derive(Debug, Clone, Default)]
pub struct FieldMap {
    pub name: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub link: Option<String>,
}

impl FieldMap {
    pub fn detect(record: &Record, candidates: &FieldCandidates) -> Self {
        let columns: Vec<&str> = record.columns().collect();
        let country = match_candidate(&columns, &candidates.country);
        let latitude = match_candidate(&columns, &candidates.latitude);
        let longitude = match_candidate(&columns, &candidates.longitude);
        let link = match_candidate(&columns, &candidates.link);
        let name = match_candidate(&columns, &candidates.name).or_else(|| {
            fallback_name_column(
                &columns,
                candidates,
                [&country, &latitude, &longitude, &link],
            )
        });
        Self {
            name,
            country,
            latitude,
            longitude,
            link,
        }
    }
}

fn match_candidate(columns: &[&str], candidates: &[String]) -> Option<String> {
    for candidate in candidates {
        let wanted = candidate.to_lowercase();
        if let Some(column) = columns
            .iter()
            .find(|column| column.to_lowercase() == wanted)
        {
            return Some(column.to_string());
        }
    }
    None
}

/// Last resort for the name role: the first column that is neither a known
/// non-location header nor already claimed by another role.
fn fallback_name_column(
    columns: &[&str],
    candidates: &FieldCandidates,
    claimed: [&Option<String>; 4],
) -> Option<String> {
    columns
        .iter()
        .find(|column| {
            let lowered = normalize_key(column);
            if candidates
                .name_denylist
                .iter()
                .any(|denied| lowered.starts_with(&normalize_key(denied)))
            {
                return false;
            }
            !claimed
                .iter()
                .any(|taken| taken.as_deref() == Some(**column))
        })
        .map(|column| column.to_string())
}

#[derive(Debug)]
pub enum Resolution {
    Resolved(Vec<ResolvedMarker>),
    Unresolved(UnresolvedReason),
}

enum ExplicitFields {
    Found(Coordinate),
    /// Coordinate columns carry the sentinel: a prior lookup already failed.
    Sentinel,
    Absent,
}

/// Applies the ordered fallback chain for one record, consulting the cache
/// and the geocoding client. Shared across all concurrent resolutions of a
/// batch; an in-flight map guarantees concurrent lookups of the same
/// normalized key share one pending call.
pub struct Resolver {
    cache: Arc<CoordinateCache>,
    client: Arc<GeocodeClient>,
    use_centroids: bool,
    inflight: AsyncMutex<HashMap<String, Arc<OnceCell<Option<Coordinate>>>>>,
}

impl Resolver {
    pub fn new(cache: Arc<CoordinateCache>, client: Arc<GeocodeClient>, use_centroids: bool) -> Self {
        Self {
            cache,
            client,
            use_centroids,
            inflight: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Drops memoized no-match results from a previous run. Called at batch
    /// start so a record that was unresolvable yesterday gets a fresh try.
    pub async fn begin_batch(&self) {
        self.inflight.lock().await.clear();
    }

    /// Steps 1 and 2 of the chain: outcomes derivable without any network
    /// call. The batch processor front-loads records where this succeeds.
    pub fn local_resolution(
        &self,
        record: &Record,
        map: &FieldMap,
    ) -> Option<(Coordinate, ResolutionSource)> {
        match explicit_fields(record, map) {
            ExplicitFields::Found(coordinate) => {
                return Some((coordinate, ResolutionSource::ExplicitField))
            }
            ExplicitFields::Sentinel => return None,
            ExplicitFields::Absent => {}
        }
        link_coordinate(record, map).map(|coordinate| (coordinate, ResolutionSource::ExternalLink))
    }

    pub async fn resolve(&self, record: &Arc<Record>, map: &FieldMap) -> Resolution {
        let sentinel = matches!(explicit_fields(record, map), ExplicitFields::Sentinel);

        if let Some((coordinate, source)) = self.local_resolution(record, map) {
            let marker = ResolvedMarker {
                record: Arc::clone(record),
                label: display_label(record, map),
                coordinate,
                source,
            };
            return Resolution::Resolved(vec![marker]);
        }

        let name_field = map.name.as_deref().and_then(|column| record.get(column));
        let country_field = map
            .country
            .as_deref()
            .and_then(|column| record.get(column));

        if name_field.is_none() && country_field.is_none() {
            return Resolution::Unresolved(UnresolvedReason::MissingFields);
        }

        // Step 3: geocode each entity packed into the name field. A sentinel
        // in the coordinate columns means this name already failed once, so
        // it is not sent to the geocoder again.
        if !sentinel {
            if let Some(name) = name_field {
                let mut markers = Vec::new();
                for entity in split_entities(name) {
                    if let Some(coordinate) = self.lookup(&normalize_key(&entity)).await {
                        markers.push(ResolvedMarker {
                            record: Arc::clone(record),
                            label: entity,
                            coordinate,
                            source: ResolutionSource::GeocodedName,
                        });
                    } else {
                        debug!(entity = %entity, "name lookup missed");
                    }
                }
                if !markers.is_empty() {
                    return Resolution::Resolved(markers);
                }
            }
        }

        // Step 4: fall back to the record's country.
        if let Some(country) = country_field {
            let label = name_field.unwrap_or(country).to_string();
            if self.use_centroids {
                if let Some(coordinate) = country_centroid(country) {
                    return Resolution::Resolved(vec![ResolvedMarker {
                        record: Arc::clone(record),
                        label,
                        coordinate,
                        source: ResolutionSource::PredefinedCountry,
                    }]);
                }
            }
            if let Some(coordinate) = self.lookup(&normalize_key(country)).await {
                return Resolution::Resolved(vec![ResolvedMarker {
                    record: Arc::clone(record),
                    label,
                    coordinate,
                    source: ResolutionSource::GeocodedCountry,
                }]);
            }
        }

        Resolution::Unresolved(UnresolvedReason::AllStrategiesMissed)
    }

    /// Cache-first lookup for one normalized key. Successful answers are
    /// written back; a no-match is memoized only for the current batch (in
    /// the in-flight map), never persisted.
    async fn lookup(&self, key: &str) -> Option<Coordinate> {
        if let Some(hit) = self.cache.get(key) {
            return Some(hit);
        }

        let cell = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        *cell
            .get_or_init(|| async {
                let found = self.client.query(key).await;
                if let Some(coordinate) = found {
                    self.cache.set(key, coordinate);
                }
                found
            })
            .await
    }
}

fn explicit_fields(record: &Record, map: &FieldMap) -> ExplicitFields {
    let lat_field = map
        .latitude
        .as_deref()
        .and_then(|column| record.get(column));
    let lon_field = map
        .longitude
        .as_deref()
        .and_then(|column| record.get(column));

    let (Some(lat_raw), Some(lon_raw)) = (lat_field, lon_field) else {
        return ExplicitFields::Absent;
    };

    if is_sentinel(lat_raw) || is_sentinel(lon_raw) {
        return ExplicitFields::Sentinel;
    }

    let parsed = lat_raw
        .parse::<f64>()
        .ok()
        .zip(lon_raw.parse::<f64>().ok())
        .and_then(|(lat, lon)| Coordinate::validated(lat, lon));
    match parsed {
        Some(coordinate) => ExplicitFields::Found(coordinate),
        None => ExplicitFields::Absent,
    }
}

fn is_sentinel(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case(NOT_FOUND_SENTINEL)
}

/// Pulls a coordinate out of a map-service URL: `q=` / `ll=` / `query=`
/// pairs, or an `@lat,lon` path segment.
fn link_coordinate(record: &Record, map: &FieldMap) -> Option<Coordinate> {
    let raw = map.link.as_deref().and_then(|column| record.get(column))?;
    let url = Url::parse(raw).ok()?;

    for (key, value) in url.query_pairs() {
        if matches!(key.as_ref(), "q" | "ll" | "query") {
            if let Some(coordinate) = parse_pair(&value) {
                return Some(coordinate);
            }
        }
    }

    let path = url.path();
    let at = path.find('@')?;
    parse_pair(&path[at + 1..])
}

fn parse_pair(value: &str) -> Option<Coordinate> {
    let mut parts = value.split(',');
    let lat = parts.next()?.trim().parse::<f64>().ok()?;
    let lon = parts.next()?.trim().parse::<f64>().ok()?;
    Coordinate::validated(lat, lon)
}

/// Multiple institutions packed into one cell become independent lookup
/// targets: split on list punctuation and on the connectors "and"/"y".
pub fn split_entities(text: &str) -> Vec<String> {
    let mut entities = Vec::new();
    for chunk in text.split(|c| matches!(c, ',' | ';' | '\n' | '/')) {
        let mut current: Vec<&str> = Vec::new();
        for word in chunk.split_whitespace() {
            if word.eq_ignore_ascii_case("and") || word == "y" {
                push_entity(&mut entities, &current);
                current.clear();
            } else {
                current.push(word);
            }
        }
        push_entity(&mut entities, &current);
    }
    entities
}

fn push_entity(entities: &mut Vec<String>, words: &[&str]) {
    if !words.is_empty() {
        entities.push(words.join(" "));
    }
}

fn display_label(record: &Record, map: &FieldMap) -> String {
    map.name
        .as_deref()
        .and_then(|column| record.get(column))
        .or_else(|| map.country.as_deref().and_then(|column| record.get(column)))
        .unwrap_or_default()
        .to_string()
}

pub fn country_centroid(country: &str) -> Option<Coordinate> {
    let key = strip_accents(&normalize_key(country));
    COUNTRY_CENTROIDS
        .iter()
        .find(|(name, _, _)| *name == key)
        .and_then(|(_, lat, lon)| Coordinate::validated(*lat, *lon))
}

fn strip_accents(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_map(record: &Record) -> FieldMap {
        FieldMap::detect(record, &FieldCandidates::default())
    }

    #[test]
    fn detects_columns_across_spellings() {
        let record = Record::from_pairs([
            ("Universidad Contraparte", "Foo"),
            ("país", "Chile"),
            ("LAT", "1.0"),
            ("Longitud", "2.0"),
            ("Web", "https://example.com"),
        ]);
        let map = default_map(&record);
        assert_eq!(map.name.as_deref(), Some("Universidad Contraparte"));
        assert_eq!(map.country.as_deref(), Some("país"));
        assert_eq!(map.latitude.as_deref(), Some("LAT"));
        assert_eq!(map.longitude.as_deref(), Some("Longitud"));
        assert_eq!(map.link.as_deref(), Some("Web"));
    }

    #[test]
    fn falls_back_past_denylisted_headers_for_name() {
        let record = Record::from_pairs([
            ("Año de firma", "2021"),
            ("Facultad", "Ingeniería"),
            ("Institución socia", "Universidad A"),
            ("País", "Chile"),
        ]);
        let map = default_map(&record);
        assert_eq!(map.name.as_deref(), Some("Institución socia"));
    }

    #[test]
    fn splits_packed_name_fields() {
        assert_eq!(
            split_entities("Universidad A, Universidad B"),
            vec!["Universidad A", "Universidad B"]
        );
        assert_eq!(
            split_entities("Universidad A y Universidad B and College C"),
            vec!["Universidad A", "Universidad B", "College C"]
        );
        assert_eq!(split_entities("Única Universidad"), vec!["Única Universidad"]);
        assert!(split_entities("  ,  ").is_empty());
    }

    #[test]
    fn extracts_coordinates_from_map_links() {
        let record = Record::from_pairs([
            ("Nombre", "Foo"),
            ("Mapa", "https://maps.google.com/?q=-33.45,-70.66"),
        ]);
        let map = default_map(&record);
        let found = link_coordinate(&record, &map).unwrap();
        assert_eq!(found.lat, -33.45);

        let at_style = Record::from_pairs([
            ("Nombre", "Bar"),
            ("Mapa", "https://www.google.com/maps/place/@40.4168,-3.7038,12z"),
        ]);
        let found = link_coordinate(&at_style, &default_map(&at_style)).unwrap();
        assert_eq!(found.lon, -3.7038);

        let no_coords = Record::from_pairs([("Nombre", "Baz"), ("Mapa", "https://example.com")]);
        assert!(link_coordinate(&no_coords, &default_map(&no_coords)).is_none());
    }

    #[test]
    fn centroid_table_ignores_case_and_accents() {
        assert!(country_centroid("México").is_some());
        assert!(country_centroid("  PERÚ ").is_some());
        assert!(country_centroid("Brazil").is_some());
        assert!(country_centroid("Atlantis").is_none());
    }

    #[test]
    fn sentinel_in_coordinate_fields_is_detected() {
        let record = Record::from_pairs([
            ("Nombre", "Foo"),
            ("Lat", "not found"),
            ("Lng", "NOT FOUND"),
            ("País", "Chile"),
        ]);
        let map = default_map(&record);
        assert!(matches!(
            explicit_fields(&record, &map),
            ExplicitFields::Sentinel
        ));
    }

    #[test]
    fn explicit_fields_require_valid_range() {
        let record = Record::from_pairs([("Nombre", "Foo"), ("Lat", "999"), ("Lng", "0")]);
        let map = default_map(&record);
        assert!(matches!(
            explicit_fields(&record, &map),
            ExplicitFields::Absent
        ));
    }
}
