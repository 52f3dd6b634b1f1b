#![warn(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_import_braces,
    unused_qualifications
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::upper_case_acronyms)]

use chrono::{DateTime, Utc};

pub mod bridge;
pub mod config;
pub mod error;
pub mod extractor;
pub mod model;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod stages;
pub mod store;
pub mod supervisor;
pub mod telemetry;

pub type RequestId = u64;
pub type ClientId = i32;
pub type TimeStamp = DateTime<Utc>;

pub use error::EngineError;

pub type Error = error::EngineError;
pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        bridge::*, config::*, error::*, model::*, registry::*, store::*, supervisor::*,
        ClientId, Error, RequestId, Result, TimeStamp,
    };
}
