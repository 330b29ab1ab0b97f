mod graphite;

pub use graphite::Graphite;
