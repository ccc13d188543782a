//! Contains the system configuration.
//!
//! Provides access to the system configuration which is loaded from the **config/settings.yml**
//! file. Note that we observe this file for changes and reload it once a change is detected.
//! Each user of the config should attach itself to the [Config::notifier](Config::notifier) and
//! re-process the config once a change message is received - being an in-memory cache we want
//! to prevent restarts as much as possible.
//!
//! The config carries one [CacheAttributes] block per cache region:
//!
//! ```yaml
//! regions:
//!     products:
//!         # Specifies the maximal number of elements to keep in memory.
//!         max_objects: 1024
//!         # Specifies how many elements are spilled per eviction batch.
//!         chunk_size: 4
//!         # Enables the background shrinker for this region.
//!         use_memory_shrinker: true
//!         # Elements idle for longer than this are expired by the shrinker.
//!         max_memory_idle_time: 2h
//!         # Specifies how often the shrinker runs.
//!         shrinker_interval: 30s
//!         # Caps the number of elements expired per shrinker run.
//!         max_spool_per_run: 500
//!         # Bounds the zombie queue of the remote client for this region.
//!         max_queue_size: 1000
//! ```
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::fmt::parse_duration;
use crate::hub::Hub;
use anyhow::Context;
use std::path::Path;

/// Contains the tuning knobs of a single cache region.
///
/// The defaults mirror a conservative production setup: a small region with batch eviction of
/// two elements and the shrinker disabled.
#[derive(Clone, Debug)]
pub struct CacheAttributes {
    /// The maximal number of elements to keep in the memory tier.
    pub max_objects: usize,

    /// The number of elements spilled to the overflow sink per eviction batch.
    pub chunk_size: usize,

    /// Determines if the background shrinker is installed for this region.
    pub use_memory_shrinker: bool,

    /// Elements which have been idle for longer than this are expired by the shrinker.
    pub max_memory_idle_time: Duration,

    /// The interval in which the shrinker scans the region.
    pub shrinker_interval: Duration,

    /// The maximal number of elements a single shrinker run may expire. Remaining expired
    /// elements are left for the next run so that a single run cannot stall the cache.
    pub max_spool_per_run: usize,

    /// Bounds the zombie queue of the remote client. Once full, the oldest buffered operation
    /// is dropped to admit the newest.
    pub max_queue_size: usize,
}

impl Default for CacheAttributes {
    fn default() -> Self {
        CacheAttributes {
            max_objects: 100,
            chunk_size: 2,
            use_memory_shrinker: false,
            max_memory_idle_time: Duration::from_secs(2 * 60 * 60),
            shrinker_interval: Duration::from_secs(30),
            max_spool_per_run: usize::MAX,
            max_queue_size: 1000,
        }
    }
}

/// Provides access to the system configuration.
///
/// Most probably a config instance is installed by the [Builder](crate::builder::Builder) and
/// can be obtained via `hub.require::<Config>()`. Note that it is highly recommended to register
/// a change listener by calling `Config::notifier()` as we expect all components to pick up
/// config changes without restarting the application.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(HashMap<String, CacheAttributes>, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the config
/// was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
///
/// Note that this handle should not be stored or kept around for long, as it will not be updated
/// if the underlying config changed.
pub struct Handle {
    config: Arc<(HashMap<String, CacheAttributes>, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will not install a change listener. This is only done by the
    /// [install](install) function.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((HashMap::new(), None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// As within docker, the file is presented as volume, we check that it is a file, as an
    /// unmounted docker volume is always presented as directory.
    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Forces the config to read the underlying file.
    ///
    /// Note that this is normally called by the framework and should not be invoked manually.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        if let Ok(metadata) = tokio::fs::metadata(&self.filename).await {
            if !metadata.is_file() {
                log::info!("Config file doesn't exist or is an unmounted docker volume - skipping config load.");
                return Ok(());
            }
        }

        let config_data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        let last_modified = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        self.load_from_string(config_data.as_str(), last_modified)
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is intended to be used in test environments where we cannot / do not want to load
    /// a config file from disk.
    ///
    /// # Example
    ///
    /// ```
    /// # use strata::config::Config;
    /// let config = Config::new("somefile.yml");
    /// config.load_from_string("
    /// regions:
    ///     products:
    ///         max_objects: 1024
    /// ", None);
    ///
    /// assert_eq!(config.current().attributes("products").max_objects, 1024);
    /// ```
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let docs = YamlLoader::load_from_str(data)
            .with_context(|| format!("Cannot parse config file {}", &self.filename))?;

        // If no "regions" object is present at all, we leave the current attributes untouched.
        // This prevents an accidental or partial config change from wiping a running setup.
        let regions = match docs.first().map(|doc| &doc["regions"]) {
            Some(Yaml::Hash(map)) => map,
            _ => {
                log::info!("Config does not contain a 'regions' object. Skipping config update.");
                self.config
                    .store(Arc::new((self.config.load().0.clone(), last_modified)));
                return Ok(());
            }
        };

        let previous = self.config.load();
        let mut result = HashMap::new();
        for (name, settings) in regions.iter() {
            if let Some(name) = name.as_str() {
                let attributes =
                    parse_region_attributes(name, previous.0.get(name), settings);
                let _ = result.insert(name.to_owned(), attributes);
            }
        }

        self.config.store(Arc::new((result, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.clone().send(());

        Ok(())
    }
}

impl Handle {
    /// Returns the attributes configured for the given region.
    ///
    /// A region which is not mentioned in the config simply receives the default attributes.
    pub fn attributes(&self, region: &str) -> CacheAttributes {
        self.config.0.get(region).cloned().unwrap_or_default()
    }
}

/// Parses the attribute block of a single region.
///
/// In case of an invalid value, the previously active attributes (or the defaults) are kept for
/// the whole region. Therefore a config problem will never damage a running region.
fn parse_region_attributes(
    name: &str,
    previous: Option<&CacheAttributes>,
    settings: &Yaml,
) -> CacheAttributes {
    let fallback = previous.cloned().unwrap_or_default();
    let mut attributes = fallback.clone();

    let result: anyhow::Result<()> = (|| {
        if let Some(max_objects) = read_count(&settings["max_objects"], "max_objects")? {
            attributes.max_objects = max_objects;
        }
        if let Some(chunk_size) = read_count(&settings["chunk_size"], "chunk_size")? {
            attributes.chunk_size = chunk_size;
        }
        if let Some(max_spool) = read_count(&settings["max_spool_per_run"], "max_spool_per_run")? {
            attributes.max_spool_per_run = max_spool;
        }
        if let Some(queue_size) = read_count(&settings["max_queue_size"], "max_queue_size")? {
            attributes.max_queue_size = queue_size;
        }
        if let Some(flag) = settings["use_memory_shrinker"].as_bool() {
            attributes.use_memory_shrinker = flag;
        }
        if let Some(idle) = read_duration(&settings["max_memory_idle_time"], "max_memory_idle_time")?
        {
            attributes.max_memory_idle_time = idle;
        }
        if let Some(interval) = read_duration(&settings["shrinker_interval"], "shrinker_interval")?
        {
            attributes.shrinker_interval = interval;
        }

        Ok(())
    })();

    match result {
        Ok(()) => attributes,
        Err(error) => {
            log::error!(
                "Not going to update the attributes of region {}: {}",
                name,
                error
            );
            fallback
        }
    }
}

/// Reads a positive count value or **None** if the setting is absent.
fn read_count(value: &Yaml, setting: &str) -> anyhow::Result<Option<usize>> {
    match value {
        Yaml::BadValue => Ok(None),
        other => match other.as_i64().filter(|value| *value > 0) {
            Some(count) => Ok(Some(count as usize)),
            None => Err(anyhow::anyhow!("'{}' must be a positive number", setting)),
        },
    }
}

/// Reads a duration (either an integer in seconds or a string like "30s" / "2h") or **None**
/// if the setting is absent.
fn read_duration(value: &Yaml, setting: &str) -> anyhow::Result<Option<Duration>> {
    match value {
        Yaml::BadValue => Ok(None),
        Yaml::Integer(seconds) if *seconds > 0 => Ok(Some(Duration::from_secs(*seconds as u64))),
        Yaml::String(str) => parse_duration(str)
            .map(Some)
            .with_context(|| format!("Failed to parse '{}'", setting)),
        _ => Err(anyhow::anyhow!(
            "'{}' must be a positive number of seconds or a duration expression",
            setting
        )),
    }
}

/// Creates and installs a **Config** for the given hub.
///
/// This will read its contents from **settings.yml** and also install a change listener for this
/// file. Note that this listener will only watch the "last modified" date of the file and will
/// not perform a structural comparison. Therefore it is the duty of each config user to
/// gracefully handle partial config changes.
///
/// Note that this method is also called by the [Builder](crate::builder::Builder) unless the
/// **Config** part is disabled.
pub async fn install(hub: Arc<Hub>) {
    // Create the "config" directory in case it doesn't exist...
    let path = Path::new("config").to_path_buf();
    if let Err(error) = tokio::fs::create_dir_all(path.clone()).await {
        log::warn!(
            "Failed to create config base directory {}: {}",
            path.to_string_lossy(),
            error
        )
    }

    let config = Arc::new(Config::new("config/settings.yml"));
    hub.register::<Config>(config.clone());

    // Actually try to read the file...
    if let Err(error) = config.load().await {
        log::error!("{}", error);
    }

    // Install a change listener which runs every 2s...
    run_config_change_monitor(hub, config);
}

#[cfg(test)]
fn run_config_change_monitor(_hub: Arc<Hub>, _config: Arc<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(hub: Arc<Hub>, config: Arc<Config>) {
    let _ = tokio::spawn(async move {
        while hub.is_running() {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            // This will contain the last modified date of the file on disk or be None if the
            // file is absent...
            let last_modified = config.last_modified().await;

            // Contains the timestamp when the file was loaded the last time or be None if no
            // data has been loaded yet...
            let last_loaded = config.config.load().1;

            // If a file is present and newer than the one previously loaded (or if none has been
            // loaded so far) -> perform a reload and broadcast an update if the file has been
            // successfully loaded...
            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => {
                        log::info!("System configuration was re-loaded.");
                    }
                    Err(error) => log::error!("Failed to re-load system config: {}", error),
                }
            }
        }
    });
}
