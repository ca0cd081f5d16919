//! Default values for configuration

/// Default SQLite pool size
pub fn default_max_connections() -> u32 {
    5
}

/// Default HTTP bind address, overridable with PLATEAU_FEED_BIND
pub fn default_bind() -> String {
    std::env::var("PLATEAU_FEED_BIND").unwrap_or_else(|_| "127.0.0.1:8000".to_string())
}

/// Cache-Control max-age for building responses
pub fn default_cache_max_age_secs() -> u64 {
    300
}

/// Default: suppress identical footprints arriving under a different source id
pub fn default_dedupe_geometry() -> bool {
    true
}

/// Tag carrying the PLATEAU building id in converted OSM files
pub fn default_source_id_tag() -> String {
    "ref:MLIT_PLATEAU".to_string()
}

/// Consecutive storage failures tolerated before a batch is aborted
pub fn default_max_consecutive_store_errors() -> usize {
    20
}

/// Default number of buildings per response
pub fn default_query_limit() -> usize {
    1000
}

/// Hard cap on buildings per response
pub fn default_query_max_limit() -> usize {
    10_000
}

pub fn default_generator() -> String {
    format!("plateau-feed {}", env!("CARGO_PKG_VERSION"))
}

pub fn default_copyright() -> String {
    "Plateau Japan".to_string()
}

pub fn default_attribution() -> String {
    "https://www.mlit.go.jp/plateau/".to_string()
}

pub fn default_license() -> String {
    "https://www.mlit.go.jp/plateau/".to_string()
}

/// User name stamped on emitted elements
pub fn default_user() -> String {
    "osmfj-plateau".to_string()
}
