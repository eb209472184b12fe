use parking_lot::Mutex;

use crate::pipeline::BatchSummary;
use crate::record::ResolvedMarker;

/// Consumer of resolved markers. Markers arrive one at a time as their
/// resolutions settle, in no particular order; `complete` fires once, after
/// the final chunk.
pub trait ResultSink: Send + Sync {
    fn accept(&self, marker: ResolvedMarker);
    fn complete(&self, summary: BatchSummary);
}

#[derive(Default)]
struct IndexState {
    markers: Vec<ResolvedMarker>,
    visible: Vec<ResolvedMarker>,
    country_filter: Option<String>,
    search: Option<String>,
    summary: Option<BatchSummary>,
}

/// Accumulates markers and answers filter/search queries over them, usable
/// before the batch completes: the active filter is re-applied on every
/// append, so partial results stay consistent with the current selection.
pub struct MarkerIndex {
    country_column: Option<String>,
    state: Mutex<IndexState>,
}

impl MarkerIndex {
    pub fn new(country_column: Option<String>) -> Self {
        Self {
            country_column,
            state: Mutex::new(IndexState::default()),
        }
    }

    /// Markers whose record matches the active country filter and search
    /// query. With neither active this is every accumulated marker.
    pub fn visible(&self) -> Vec<ResolvedMarker> {
        self.state.lock().visible.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().markers.is_empty()
    }

    pub fn set_country_filter(&self, country: Option<String>) {
        let mut state = self.state.lock();
        state.country_filter = country.filter(|value| !value.trim().is_empty());
        self.refilter(&mut state);
    }

    /// Case-insensitive substring search across every field of the source
    /// record, plus the marker label.
    pub fn set_search(&self, query: Option<String>) {
        let mut state = self.state.lock();
        state.search = query
            .map(|q| q.trim().to_lowercase())
            .filter(|q| !q.is_empty());
        self.refilter(&mut state);
    }

    /// Sorted distinct values of a column across accumulated markers; feeds
    /// the filter dropdown.
    pub fn unique_values(&self, column: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut values: Vec<String> = state
            .markers
            .iter()
            .filter_map(|marker| marker.record.get(column))
            .map(|value| value.to_string())
            .collect();
        values.sort();
        values.dedup();
        values
    }

    pub fn summary(&self) -> Option<BatchSummary> {
        self.state.lock().summary.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().summary.is_some()
    }

    fn matches(&self, state: &IndexState, marker: &ResolvedMarker) -> bool {
        if let Some(wanted) = &state.country_filter {
            let country = self
                .country_column
                .as_deref()
                .and_then(|column| marker.record.get(column));
            if country != Some(wanted.as_str()) {
                return false;
            }
        }

        if let Some(query) = &state.search {
            let in_label = marker.label.to_lowercase().contains(query);
            let in_fields = marker
                .record
                .entries()
                .any(|(_, value)| value.to_lowercase().contains(query));
            if !in_label && !in_fields {
                return false;
            }
        }

        true
    }

    fn refilter(&self, state: &mut IndexState) {
        let visible: Vec<ResolvedMarker> = state
            .markers
            .iter()
            .filter(|marker| self.matches(state, marker))
            .cloned()
            .collect();
        state.visible = visible;
    }
}

impl ResultSink for MarkerIndex {
    fn accept(&self, marker: ResolvedMarker) {
        let mut state = self.state.lock();
        if self.matches(&state, &marker) {
            state.visible.push(marker.clone());
        }
        state.markers.push(marker);
    }

    fn complete(&self, summary: BatchSummary) {
        self.state.lock().summary = Some(summary);
    }
}
