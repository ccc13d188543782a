//! Provides a builder which can be used to setup and initialize the cache framework.
//!
//! This can be used to create and setup the central parts of the framework. As Strata provides
//! some optional modules, a builder permits to selectively enable or disable them.
//!
//! # Example
//! Setting up the framework with all features enabled:
//! ```no_run
//! # use strata::builder::Builder;
//! # use strata::regions::CacheRegions;
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the hub...
//!     let hub = Builder::new().enable_all().build().await;
//!
//!     // Obtain typed stores from the region manager...
//!     let products = hub.require::<CacheRegions>().region::<String>("products").unwrap();
//! }
//! ```
use std::sync::Arc;

use crate::hub::Hub;
use crate::{init_logging, STRATA_VERSION};

/// Initializes the framework by creating and initializing all core components.
///
/// As Strata provides a bunch of components of which some are optional, the actual setup
/// can be configured here.
///
/// # Example
/// Setting up the framework with all features enabled:
/// ```no_run
/// # use strata::builder::Builder;
/// # use strata::regions::CacheRegions;
/// #[tokio::main]
/// async fn main() {
///     // Enable all features and build the hub...
///     let hub = Builder::new().enable_all().build().await;
///
///     // Obtain typed stores from the region manager...
///     let products = hub.require::<CacheRegions>().region::<String>("products").unwrap();
/// }
/// ```
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_regions: bool,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder {
            setup_logging: false,
            enable_signals: false,
            setup_config: false,
            setup_regions: false,
        }
    }

    /// Enables all features.
    ///
    /// Note that using this method (and then maybe disabling selected components) is quite
    /// convenient, but be aware that new components which might be added in a library update
    /// will then also be enabled by default. This might or might not be the expected behaviour.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_regions = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout. As we intend Strata
    /// based applications to be run in docker containers, this is all that is needed for proper
    /// logging. The date format being used is digestible by established tools like **greylog**.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the framework once **CTRL-C** or **SIGHUP**
    /// is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs [config::Config](crate::config::Config) and loads the **settings.yml**.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables setting up a **Config** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Creates and installs a [CacheRegions](crate::regions::CacheRegions) instance.
    ///
    /// For more details see: [regions](crate::regions)
    pub fn enable_regions(mut self) -> Self {
        self.setup_regions = true;
        self
    }

    /// Disables setting up a **CacheRegions** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_regions(mut self) -> Self {
        self.setup_regions = false;
        self
    }

    /// Builds the [Hub](crate::hub::Hub) registry with all the enabled components being
    /// registered.
    pub async fn build(self) -> Arc<Hub> {
        let hub = Hub::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. STRATA (v {}) running on {} core(s) in {} CPU(s)",
            STRATA_VERSION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(hub.clone());
        }

        if self.setup_config {
            crate::config::install(hub.clone()).await;
        }

        if self.setup_regions {
            crate::regions::install(&hub);
        }

        hub
    }
}
