use std::env;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod audio;
pub mod config;
pub mod dataset;
pub mod dict;
pub mod distributed;
pub mod error;
pub mod loader;
pub mod logging;
pub mod loss;
pub mod model;
pub mod optim;
pub mod symbols;
pub mod synthesis;
pub mod tacotron2;
pub mod text;
pub mod trainer;
pub mod vocoder;

pub use error::Error;

pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("polyvox=info,app=info,dataset=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();
}
