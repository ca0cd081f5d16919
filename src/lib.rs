//! plateau-feed: PLATEAU building footprints served as OSM XML
//!
//! Ingests per-municipality OSM conversions of PLATEAU 3D city models into
//! SQLite and answers bounding-box queries from MapWithAI/RapiD with
//! OSM 0.6 documents.

pub mod commands;
pub mod config;
pub mod error;
pub mod geom;
pub mod normalize;
pub mod osm;
pub mod progress;
pub mod query;
pub mod server;
pub mod source;
pub mod store;
