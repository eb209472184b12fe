mod cache;
mod config;
mod diagnostics;
mod errors;
mod geocoder;
mod pipeline;
mod record;
mod resolve;
mod sink;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use cache::CoordinateCache;
pub use config::{FieldCandidates, PipelineConfig};
pub use diagnostics::{DiagnosticEvent, DiagnosticsLog};
pub use errors::{PipelineError, PipelineResult};
pub use geocoder::{GeocodeClient, GeocodeLookup};
pub use pipeline::{BatchPipeline, BatchProgress, BatchSummary, ProgressObserver};
pub use record::{
    normalize_key, Coordinate, Record, ResolutionSource, ResolvedMarker, UnresolvedReason,
};
pub use resolve::{country_centroid, split_entities, FieldMap, Resolution, Resolver,
    NOT_FOUND_SENTINEL};
pub use sink::{MarkerIndex, ResultSink};

/// Installs the global tracing subscriber once; `RUST_LOG` overrides the
/// default filter, which keeps this crate at debug when unset.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,partner_map=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
