pub mod budget;
pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod resolver;
pub mod stages;
pub mod strata_config;
