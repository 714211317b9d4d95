//! Backend lookup by name
//!
//! Drivers and reporters are selected from configuration by name. The
//! [`Factories`] object is built once at startup and handed to whoever needs
//! to construct a backend.

use crate::containers::{CgroupDriver, ContainerDriver, DriverError, DriverSettings, MockDriver};
use crate::reporting::{HttpReporter, MockReporter, Reporter, ReporterSettings, ReportingError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const CGROUP_DRIVER: &str = "cgroup";
pub const MOCK_DRIVER: &str = "mock";
pub const MOCK_REPORTER: &str = "mock";
pub const HTTP_REPORTER: &str = "http";

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("{kind} '{name}' is already registered")]
    Duplicate { kind: &'static str, name: String },
    #[error("unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Reporter(#[from] ReportingError),
}

pub type DriverConstructor = Box<
    dyn Fn(&DriverSettings) -> Result<Arc<dyn ContainerDriver>, DriverError> + Send + Sync,
>;

pub type ReporterConstructor =
    Box<dyn Fn(&ReporterSettings) -> Result<Arc<dyn Reporter>, ReportingError> + Send + Sync>;

/// Name to constructor maps for drivers and reporters
#[derive(Default)]
pub struct Factories {
    drivers: HashMap<String, DriverConstructor>,
    reporters: HashMap<String, ReporterConstructor>,
}

impl Factories {
    /// Empty factories
    pub fn new() -> Self {
        Self::default()
    }

    /// Factories knowing the built-in backends
    pub fn with_defaults() -> Self {
        let mut factories = Self::new();

        // Names are distinct, registration cannot fail here
        let _ = factories.register_driver(CGROUP_DRIVER, |settings| {
            let driver = CgroupDriver::open(
                &settings.cgroup_root,
                &settings.proc_root,
                settings.sample_rate,
            )?;
            Ok(Arc::new(driver) as Arc<dyn ContainerDriver>)
        });
        let _ = factories.register_driver(MOCK_DRIVER, |_| {
            Ok(Arc::new(MockDriver::new()) as Arc<dyn ContainerDriver>)
        });
        let _ = factories.register_reporter(MOCK_REPORTER, |_| {
            Ok(Arc::new(MockReporter::new()) as Arc<dyn Reporter>)
        });
        let _ = factories.register_reporter(HTTP_REPORTER, |settings| {
            Ok(Arc::new(HttpReporter::new(settings)?) as Arc<dyn Reporter>)
        });

        factories
    }

    pub fn register_driver<F>(&mut self, name: &str, constructor: F) -> Result<(), FactoryError>
    where
        F: Fn(&DriverSettings) -> Result<Arc<dyn ContainerDriver>, DriverError>
            + Send
            + Sync
            + 'static,
    {
        if self.drivers.contains_key(name) {
            return Err(FactoryError::Duplicate {
                kind: "driver",
                name: name.to_string(),
            });
        }
        self.drivers.insert(name.to_string(), Box::new(constructor));
        debug!(driver = name, "Registered container driver");
        Ok(())
    }

    pub fn register_reporter<F>(&mut self, name: &str, constructor: F) -> Result<(), FactoryError>
    where
        F: Fn(&ReporterSettings) -> Result<Arc<dyn Reporter>, ReportingError>
            + Send
            + Sync
            + 'static,
    {
        if self.reporters.contains_key(name) {
            return Err(FactoryError::Duplicate {
                kind: "reporter",
                name: name.to_string(),
            });
        }
        self.reporters.insert(name.to_string(), Box::new(constructor));
        debug!(reporter = name, "Registered reporter");
        Ok(())
    }

    pub fn create_driver(
        &self,
        name: &str,
        settings: &DriverSettings,
    ) -> Result<Arc<dyn ContainerDriver>, FactoryError> {
        let constructor = self.drivers.get(name).ok_or_else(|| FactoryError::Unknown {
            kind: "driver",
            name: name.to_string(),
        })?;
        Ok(constructor(settings)?)
    }

    pub fn create_reporter(
        &self,
        name: &str,
        settings: &ReporterSettings,
    ) -> Result<Arc<dyn Reporter>, FactoryError> {
        let constructor = self
            .reporters
            .get(name)
            .ok_or_else(|| FactoryError::Unknown {
                kind: "reporter",
                name: name.to_string(),
            })?;
        Ok(constructor(settings)?)
    }

    /// Registered driver names, sorted
    pub fn driver_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered reporter names, sorted
    pub fn reporter_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.reporters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
