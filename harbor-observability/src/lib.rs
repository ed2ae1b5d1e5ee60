pub mod metrics;

pub use metrics::ManagerMetrics;
