use std::{env, io};

use tracing::debug;

const DEFAULT_GEOCODING_DELAY_MS: u64 = 500;
const DEFAULT_CHUNK_SIZE: usize = 4;
const DEFAULT_CHUNK_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_BACKOFF_MS: u64 = 250;
const DEFAULT_MAX_BACKOFF_MS: u64 = 8_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CACHE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub geocoding_delay_ms: u64,
    pub chunk_size: usize,
    pub chunk_delay_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub relay_endpoints: Vec<String>,
    pub accept_language: String,
    pub cache_file_name: String,
    pub cache_ttl_secs: Option<u64>,
    pub clear_cache_on_start: bool,
    pub use_country_centroids: bool,
    pub fields: FieldCandidates,
}

/// Candidate header spellings per logical column role, tried in order,
/// case-insensitively. The defaults cover the spellings seen across the
/// partner sheets (accented and plain, Spanish and English).
#[derive(Clone, Debug)]
pub struct FieldCandidates {
    pub name: Vec<String>,
    pub country: Vec<String>,
    pub latitude: Vec<String>,
    pub longitude: Vec<String>,
    pub link: Vec<String>,
    pub name_denylist: Vec<String>,
}

impl Default for FieldCandidates {
    fn default() -> Self {
        Self {
            name: to_owned(&[
                "Universidad contraparte",
                "Universidad Contraparte",
                "Universidad",
                "Contraparte",
                "Nombre",
                "Institución",
                "Institucion",
                "Name",
            ]),
            country: to_owned(&["País", "Pais", "Country"]),
            latitude: to_owned(&["Latitud", "Lat", "Latitude"]),
            longitude: to_owned(&["Longitud", "Lng", "Lon", "Longitude"]),
            link: to_owned(&["Mapa", "Map", "Web", "Website", "Enlace mapa"]),
            name_denylist: to_owned(&[
                "año",
                "ano",
                "year",
                "facultad",
                "faculty",
                "resumen",
                "summary",
                "tipo",
                "vigente",
                "expediente",
                "región",
                "region",
                "ciudad",
                "acceso",
                "fecha",
                "date",
            ]),
        }
    }
}

fn to_owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            geocoding_delay_ms: DEFAULT_GEOCODING_DELAY_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_ms: DEFAULT_CHUNK_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            relay_endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            accept_language: "es,en".to_string(),
            cache_file_name: "geocode-cache.db".to_string(),
            cache_ttl_secs: None,
            clear_cache_on_start: false,
            use_country_centroids: true,
            fields: FieldCandidates::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            geocoding_delay_ms: parse_u64("GEOCODING_DELAY_MS", DEFAULT_GEOCODING_DELAY_MS),
            chunk_size: parse_usize("GEOCODE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE).max(1),
            chunk_delay_ms: parse_u64("GEOCODE_CHUNK_DELAY_MS", DEFAULT_CHUNK_DELAY_MS),
            max_retries: parse_u32("GEOCODE_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            base_backoff_ms: parse_u64("GEOCODE_BASE_BACKOFF_MS", DEFAULT_BASE_BACKOFF_MS).max(1),
            max_backoff_ms: parse_u64("GEOCODE_MAX_BACKOFF_MS", DEFAULT_MAX_BACKOFF_MS),
            request_timeout_secs: parse_u64(
                "GEOCODE_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )
            .max(1),
            relay_endpoints: parse_endpoints("GEOCODER_ENDPOINTS", defaults.relay_endpoints),
            accept_language: env::var("GEOCODER_ACCEPT_LANGUAGE")
                .unwrap_or(defaults.accept_language),
            cache_file_name: env::var("GEOCODE_CACHE_FILE_NAME")
                .unwrap_or(defaults.cache_file_name),
            cache_ttl_secs: parse_optional_ttl("GEOCODE_CACHE_TTL_SECS"),
            clear_cache_on_start: parse_bool("GEOCODE_CLEAR_CACHE_ON_START", false),
            use_country_centroids: parse_bool("GEOCODE_USE_COUNTRY_CENTROIDS", true),
            fields: defaults.fields,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_endpoints(key: &str, default: Vec<String>) -> Vec<String> {
    let Ok(raw) = env::var(key) else {
        return default;
    };
    let endpoints: Vec<String> = raw
        .split(',')
        .map(|entry| entry.trim().trim_end_matches('/').to_string())
        .filter(|entry| !entry.is_empty())
        .collect();
    if endpoints.is_empty() {
        default
    } else {
        endpoints
    }
}

fn parse_optional_ttl(key: &str) -> Option<u64> {
    match env::var(key) {
        Ok(value) if value.trim().eq_ignore_ascii_case("default") => Some(DEFAULT_CACHE_TTL_SECS),
        Ok(value) => value.trim().parse::<u64>().ok().filter(|ttl| *ttl > 0),
        Err(_) => None,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
