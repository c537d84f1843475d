//! CLI command implementations.
//!
//! | Module     | Commands handled      |
//! |------------|-----------------------|
//! | `run`      | `Run`                 |
//! | `plan`     | `Plan`                |
//! | `status`   | `Status`, `Abort`     |
//! | `resolve`  | `Resolve`, `Size`     |
//! | `config`   | `Config`              |

pub mod config;
pub mod plan;
pub mod resolve;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use plan::cmd_plan;
pub use resolve::{build_query, cmd_resolve, cmd_size};
pub use run::cmd_run;
pub use status::{cmd_abort, cmd_status};

use anyhow::Result;
use strata::budget::{ProjectSizeClass, SizeDetection};
use strata::config::Config;

/// Size class and limit a run would use, with the detection that chose the
/// class when it was not configured.
pub(crate) struct EffectiveBudget {
    pub size_class: ProjectSizeClass,
    pub limit: u64,
    pub detection: Option<SizeDetection>,
}

pub(crate) fn effective_budget(config: &Config) -> Result<EffectiveBudget> {
    let (size_class, detection) = match config.size_class {
        Some(class) => (class, None),
        None => {
            let digest = config.find_digest();
            let detection = ProjectSizeClass::detect(digest.as_deref(), &config.codebase_dir)?;
            (detection.class, Some(detection))
        }
    };
    let limit = config
        .file
        .budget
        .limit
        .unwrap_or_else(|| size_class.default_limit());
    Ok(EffectiveBudget {
        size_class,
        limit,
        detection,
    })
}
