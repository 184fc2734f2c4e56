pub mod logging;

pub use logging::{level_for_verbosity, setup_logging};
