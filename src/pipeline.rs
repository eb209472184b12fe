use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cache::CoordinateCache;
use crate::config::PipelineConfig;
use crate::diagnostics::DiagnosticsLog;
use crate::errors::PipelineResult;
use crate::geocoder::GeocodeClient;
use crate::record::Record;
use crate::resolve::{FieldMap, Resolution, Resolver};
use crate::sink::ResultSink;

#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub total_records: usize,
    pub processed: usize,
    pub resolved_markers: usize,
    pub unresolved_records: usize,
}

pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total_records: usize,
    pub resolved_markers: usize,
    pub unresolved_records: usize,
    pub failed_lookups: u64,
    pub chunks: usize,
}

/// Drives a full record set through resolution: records whose coordinates
/// are already explicit settle first (they need no throttling), the rest go
/// through fixed-size chunks with a pause between chunks, on top of the
/// client's own inter-call spacing. A failure inside one record's
/// resolution never aborts siblings or later chunks.
pub struct BatchPipeline {
    cache: Arc<CoordinateCache>,
    client: Arc<GeocodeClient>,
    resolver: Resolver,
    config: PipelineConfig,
    diagnostics: Option<DiagnosticsLog>,
    guard: AsyncMutex<()>,
}

impl BatchPipeline {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: PipelineConfig) -> PipelineResult<Self> {
        let ttl = config.cache_ttl_secs.map(Duration::from_secs);
        let cache = Arc::new(CoordinateCache::open(
            data_dir,
            &config.cache_file_name,
            ttl,
        )?);
        let client = Arc::new(GeocodeClient::new(&config)?);
        Ok(Self::from_parts(cache, client, config))
    }

    pub fn from_parts(
        cache: Arc<CoordinateCache>,
        client: Arc<GeocodeClient>,
        config: PipelineConfig,
    ) -> Self {
        let resolver = Resolver::new(
            Arc::clone(&cache),
            Arc::clone(&client),
            config.use_country_centroids,
        );
        Self {
            cache,
            client,
            resolver,
            config,
            diagnostics: None,
            guard: AsyncMutex::new(()),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsLog) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn cache(&self) -> &CoordinateCache {
        &self.cache
    }

    pub async fn process(
        &self,
        records: Vec<Record>,
        sink: Arc<dyn ResultSink>,
        observer: Option<ProgressObserver>,
    ) -> PipelineResult<BatchSummary> {
        let _running = self.guard.lock().await;

        if self.config.clear_cache_on_start {
            if let Err(err) = self.cache.clear() {
                warn!(error = %err, "cache clear at batch start failed");
            }
        }
        self.resolver.begin_batch().await;

        let records: Vec<Arc<Record>> = records
            .into_iter()
            .filter(|record| !record.is_empty())
            .map(Arc::new)
            .collect();
        let total_records = records.len();
        let failed_before = self.client.failed_lookups();

        let map = records
            .first()
            .map(|record| FieldMap::detect(record, &self.config.fields))
            .unwrap_or_default();

        let progress = ProgressState {
            total_records,
            processed: AtomicUsize::new(0),
            resolved_markers: AtomicUsize::new(0),
            unresolved_records: AtomicUsize::new(0),
        };

        // Free results first: explicit coordinates and map links render
        // before the first network call is made.
        let (local, remote): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| self.resolver.local_resolution(record, &map).is_some());

        for record in &local {
            let resolution = self.resolver.resolve(record, &map).await;
            self.settle(record, resolution, &sink, &progress, &observer);
        }

        let chunk_size = self.config.chunk_size.max(1);
        let chunk_delay = Duration::from_millis(self.config.chunk_delay_ms);
        let chunks = remote.chunks(chunk_size).count();
        for (index, chunk) in remote.chunks(chunk_size).enumerate() {
            if index > 0 && !chunk_delay.is_zero() {
                sleep(chunk_delay).await;
            }
            // All resolutions of a chunk settle before the next chunk
            // starts; completion order inside the chunk is unspecified.
            join_all(chunk.iter().map(|record| {
                let map = &map;
                let sink = &sink;
                let progress = &progress;
                let observer = &observer;
                async move {
                    let resolution = self.resolver.resolve(record, map).await;
                    self.settle(record, resolution, sink, progress, observer);
                }
            }))
            .await;
        }

        let summary = BatchSummary {
            total_records,
            resolved_markers: progress.resolved_markers.load(Ordering::SeqCst),
            unresolved_records: progress.unresolved_records.load(Ordering::SeqCst),
            failed_lookups: self.client.failed_lookups() - failed_before,
            chunks,
        };
        info!(
            total = summary.total_records,
            resolved = summary.resolved_markers,
            unresolved = summary.unresolved_records,
            failed_lookups = summary.failed_lookups,
            "batch complete"
        );
        self.record_diagnostics(&summary);
        sink.complete(summary.clone());
        Ok(summary)
    }

    fn settle(
        &self,
        record: &Arc<Record>,
        resolution: Resolution,
        sink: &Arc<dyn ResultSink>,
        progress: &ProgressState,
        observer: &Option<ProgressObserver>,
    ) {
        match resolution {
            Resolution::Resolved(markers) => {
                progress
                    .resolved_markers
                    .fetch_add(markers.len(), Ordering::SeqCst);
                for marker in markers {
                    sink.accept(marker);
                }
            }
            Resolution::Unresolved(reason) => {
                progress.unresolved_records.fetch_add(1, Ordering::SeqCst);
                warn!(
                    reason = reason.as_str(),
                    columns = ?record.columns().collect::<Vec<_>>(),
                    "record left unresolved"
                );
                if let Some(diagnostics) = &self.diagnostics {
                    let _ = diagnostics.record(
                        "record_unresolved",
                        serde_json::json!({ "reason": reason.as_str() }),
                    );
                }
            }
        }

        progress.processed.fetch_add(1, Ordering::SeqCst);
        if let Some(callback) = observer {
            callback(BatchProgress {
                total_records: progress.total_records,
                processed: progress.processed.load(Ordering::SeqCst),
                resolved_markers: progress.resolved_markers.load(Ordering::SeqCst),
                unresolved_records: progress.unresolved_records.load(Ordering::SeqCst),
            });
        }
    }

    fn record_diagnostics(&self, summary: &BatchSummary) {
        let Some(diagnostics) = &self.diagnostics else {
            return;
        };
        let recorded = diagnostics.record(
            "batch_complete",
            serde_json::json!({
                "total_records": summary.total_records,
                "resolved_markers": summary.resolved_markers,
                "unresolved_records": summary.unresolved_records,
                "failed_lookups": summary.failed_lookups,
                "chunks": summary.chunks,
            }),
        );
        if let Err(err) = recorded.and_then(|_| diagnostics.flush()) {
            warn!(error = %err, "failed to persist batch diagnostics");
        }
    }
}

struct ProgressState {
    total_records: usize,
    processed: AtomicUsize,
    resolved_markers: AtomicUsize,
    unresolved_records: AtomicUsize,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::errors::PipelineError;
    use crate::geocoder::GeocodeLookup;
    use crate::record::{Coordinate, ResolutionSource, ResolvedMarker};

    struct MapRelay {
        answers: HashMap<String, Coordinate>,
        calls: Mutex<Vec<String>>,
    }

    impl MapRelay {
        fn new(answers: &[(&str, f64, f64)]) -> Arc<Self> {
            Arc::new(Self {
                answers: answers
                    .iter()
                    .map(|(key, lat, lon)| {
                        (key.to_string(), Coordinate::validated(*lat, *lon).unwrap())
                    })
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl GeocodeLookup for MapRelay {
        async fn search(&self, query: &str) -> Result<Option<Coordinate>, PipelineError> {
            self.calls.lock().push(query.to_string());
            Ok(self.answers.get(query).copied())
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        markers: Mutex<Vec<ResolvedMarker>>,
        summary: Mutex<Option<BatchSummary>>,
    }

    impl ResultSink for CollectingSink {
        fn accept(&self, marker: ResolvedMarker) {
            self.markers.lock().push(marker);
        }

        fn complete(&self, summary: BatchSummary) {
            *self.summary.lock() = Some(summary);
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            geocoding_delay_ms: 0,
            chunk_delay_ms: 0,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            max_retries: 0,
            chunk_size: 3,
            use_country_centroids: false,
            ..PipelineConfig::default()
        }
    }

    fn pipeline_with(relay: Arc<MapRelay>, config: PipelineConfig) -> BatchPipeline {
        let cache = Arc::new(CoordinateCache::in_memory(None).unwrap());
        let client = Arc::new(GeocodeClient::from_relays(
            vec![relay as Arc<dyn GeocodeLookup>],
            &config,
        ));
        BatchPipeline::from_parts(cache, client, config)
    }

    fn record(pairs: &[(&str, &str)]) -> Record {
        Record::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
    }

    #[tokio::test]
    async fn explicit_records_settle_before_any_network_call() {
        let relay = MapRelay::new(&[("universidad de chile", -33.45, -70.66)]);
        let pipeline = pipeline_with(relay.clone(), fast_config());
        let sink = Arc::new(CollectingSink::default());

        let records = vec![
            record(&[
                ("Nombre", "Universidad de Chile"),
                ("Lat", ""),
                ("Lng", ""),
            ]),
            record(&[("Nombre", "Pinned"), ("Lat", "10.0"), ("Lng", "20.0")]),
        ];
        pipeline
            .process(records, sink.clone(), None)
            .await
            .unwrap();

        let markers = sink.markers.lock();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].source, ResolutionSource::ExplicitField);
        assert_eq!(markers[1].source, ResolutionSource::GeocodedName);
    }

    #[tokio::test]
    async fn explicit_coordinates_never_invoke_the_client() {
        let relay = MapRelay::new(&[]);
        let pipeline = pipeline_with(relay.clone(), fast_config());
        let sink = Arc::new(CollectingSink::default());

        let records = vec![record(&[
            ("Nombre", "Pinned"),
            ("País", "Chile"),
            ("Lat", "10.0"),
            ("Lng", "20.0"),
        ])];
        let summary = pipeline
            .process(records, sink.clone(), None)
            .await
            .unwrap();

        assert!(relay.calls().is_empty());
        assert_eq!(summary.resolved_markers, 1);
    }

    #[tokio::test]
    async fn seven_records_form_three_strictly_ordered_chunks() {
        let answers: Vec<(String, f64, f64)> = (0..7)
            .map(|i| (format!("uni {i}"), 1.0 + i as f64, 2.0))
            .collect();
        let answer_refs: Vec<(&str, f64, f64)> = answers
            .iter()
            .map(|(name, lat, lon)| (name.as_str(), *lat, *lon))
            .collect();
        let relay = MapRelay::new(&answer_refs);
        let pipeline = pipeline_with(relay.clone(), fast_config());
        let sink = Arc::new(CollectingSink::default());

        let records: Vec<Record> = (0..7)
            .map(|i| Record::from_pairs([("Nombre".to_string(), format!("Uni {i}"))]))
            .collect();
        let summary = pipeline
            .process(records, sink.clone(), None)
            .await
            .unwrap();

        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.resolved_markers, 7);

        // every chunk's queries land before any query of the next chunk
        let calls = relay.calls();
        let position = |query: &str| calls.iter().position(|c| c == query).unwrap();
        for early in 0..3 {
            for late in 3..7 {
                assert!(position(&format!("uni {early}")) < position(&format!("uni {late}")));
            }
        }
        for early in 3..6 {
            assert!(position(&format!("uni {early}")) < position("uni 6"));
        }
    }

    #[tokio::test]
    async fn one_unresolvable_record_does_not_stop_the_batch() {
        let relay = MapRelay::new(&[("uni b", 4.0, 5.0)]);
        let pipeline = pipeline_with(relay, fast_config());
        let sink = Arc::new(CollectingSink::default());

        let records = vec![
            record(&[("Nombre", "Uni A")]),
            record(&[("Nombre", "Uni B")]),
        ];
        let summary = pipeline
            .process(records, sink.clone(), None)
            .await
            .unwrap();

        assert_eq!(summary.resolved_markers, 1);
        assert_eq!(summary.unresolved_records, 1);
        assert!(sink.summary.lock().is_some());
    }

    #[tokio::test]
    async fn repeated_keys_hit_the_network_once() {
        let relay = MapRelay::new(&[("universidad nacional", 3.0, 4.0)]);
        let config = fast_config();
        let cache = Arc::new(CoordinateCache::in_memory(None).unwrap());
        let client = Arc::new(GeocodeClient::from_relays(
            vec![relay.clone() as Arc<dyn GeocodeLookup>],
            &config,
        ));
        let pipeline = BatchPipeline::from_parts(cache, client, config);

        // same name under different casing and spacing, in the same chunk
        let records = vec![
            record(&[("Nombre", "Universidad   Nacional")]),
            record(&[("Nombre", "universidad nacional")]),
        ];
        let sink = Arc::new(CollectingSink::default());
        pipeline
            .process(records, sink.clone(), None)
            .await
            .unwrap();
        assert_eq!(relay.calls().len(), 1);

        // a second run resolves purely from the persistent cache
        let records = vec![record(&[("Nombre", "UNIVERSIDAD NACIONAL")])];
        let sink = Arc::new(CollectingSink::default());
        pipeline
            .process(records, sink.clone(), None)
            .await
            .unwrap();
        assert_eq!(relay.calls().len(), 1);
        assert_eq!(sink.markers.lock()[0].coordinate.lat, 3.0);
    }

    #[tokio::test]
    async fn records_batch_outcome_to_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = DiagnosticsLog::new(dir.path()).unwrap();
        let relay = MapRelay::new(&[("uni a", 1.0, 1.0)]);
        let pipeline =
            pipeline_with(relay, fast_config()).with_diagnostics(diagnostics.clone());

        let records = vec![
            record(&[("Nombre", "Uni A")]),
            record(&[("Nombre", "Uni Desconocida")]),
        ];
        pipeline
            .process(records, Arc::new(CollectingSink::default()), None)
            .await
            .unwrap();

        let buffer = std::fs::read_to_string(diagnostics.buffer_path()).unwrap();
        assert!(buffer.contains("record_unresolved"));
        assert!(buffer.contains("batch_complete"));
    }

    #[tokio::test]
    async fn progress_observer_sees_every_settled_record() {
        let relay = MapRelay::new(&[("uni a", 1.0, 1.0), ("uni b", 2.0, 2.0)]);
        let pipeline = pipeline_with(relay, fast_config());
        let sink = Arc::new(CollectingSink::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_callback = Arc::clone(&seen);
        let observer: ProgressObserver = Arc::new(move |progress: BatchProgress| {
            seen_by_callback.lock().push(progress.processed);
        });

        let records = vec![
            record(&[("Nombre", "Uni A")]),
            record(&[("Nombre", "Uni B")]),
        ];
        pipeline
            .process(records, sink, Some(observer))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![1, 2]);
    }
}
