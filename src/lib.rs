pub mod backfill;
pub mod cli;
pub mod config;
pub mod counter_model;
pub mod dashboard;
pub mod engine;
pub mod estimator;
pub mod features;
pub mod hazard;
pub mod ingest;
pub mod lifecycle;
pub mod online_logreg;
pub mod policy;
pub mod signals_export;
pub mod sim_feed;
pub mod store;
pub mod tick;
pub mod tracker;
pub mod trainer;
