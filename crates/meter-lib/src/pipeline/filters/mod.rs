//! Filters of the standard chain
//!
//! The order is fixed:
//! 1. [`LoggerFilter`]
//! 2. [`RegistryFilter`]
//! 3. [`ContainerResolverFilter`]
//! 4. [`ServiceResolverFilter`]
//! 5. [`SampleCollectorFilter`]
//! 6. [`ReportGeneratorFilter`]
//! 7. [`ReporterFilter`]
//! 8. [`NotHandledFilter`]

mod collector;
mod logger;
mod not_handled;
mod registry;
mod report_gen;
mod reporter;
mod resolve_container;
mod resolve_service;

pub use collector::SampleCollectorFilter;
pub use logger::LoggerFilter;
pub use not_handled::NotHandledFilter;
pub use registry::RegistryFilter;
pub use report_gen::ReportGeneratorFilter;
pub use reporter::ReporterFilter;
pub use resolve_container::ContainerResolverFilter;
pub use resolve_service::ServiceResolverFilter;

use super::Pipeline;
use crate::collector::Collector;
use crate::containers::ContainerDriver;
use crate::health::HealthRegistry;
use crate::observability::StructuredLogger;
use crate::registry::ContainerRegistry;
use crate::reporting::Reporter;
use std::sync::Arc;

/// Filter names in chain order
pub const CHAIN: [&str; 8] = [
    logger::NAME,
    registry::NAME,
    resolve_container::NAME,
    resolve_service::NAME,
    collector::NAME,
    report_gen::NAME,
    reporter::NAME,
    not_handled::NAME,
];

/// Collaborators the standard chain is built from
#[derive(Clone)]
pub struct PipelineDeps {
    pub meter_id: String,
    pub registry: Arc<ContainerRegistry>,
    pub collector: Arc<Collector>,
    pub driver: Arc<dyn ContainerDriver>,
    pub reporter: Arc<dyn Reporter>,
    pub service_key_label: String,
    pub health: Option<HealthRegistry>,
}

/// Build the standard chain
pub fn standard_pipeline(deps: PipelineDeps) -> Pipeline {
    let logger = StructuredLogger::new(deps.meter_id.clone());

    let mut reporter = ReporterFilter::new(deps.reporter, logger.clone());
    if let Some(health) = deps.health {
        reporter = reporter.with_health(health);
    }

    Pipeline::builder()
        .filter(LoggerFilter)
        .filter(RegistryFilter::new(deps.registry.clone(), logger))
        .filter(ContainerResolverFilter::new(
            deps.driver.clone(),
            deps.registry,
        ))
        .filter(ServiceResolverFilter::new(deps.service_key_label))
        .filter(SampleCollectorFilter::new(deps.driver, deps.collector))
        .filter(ReportGeneratorFilter::new(deps.meter_id))
        .filter(reporter)
        .filter(NotHandledFilter::new())
        .build()
}
