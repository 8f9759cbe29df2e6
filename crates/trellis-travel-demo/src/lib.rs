//! Upgrade catalogs for the travel demo modules.
//!
//! Each catalog is built fresh on request. Catalog construction only fails on a malformed
//! literal, so callers may treat [`CatalogError`] as a programming error.

pub mod personalization;
pub mod pur;
pub mod travel;

use trellis_core::{CatalogBuilder, CatalogError, TaskCatalog};

pub use personalization::{personalization_catalog, PERSONALIZATION_MODULE};
pub use travel::{travel_demo_catalog, TRAVEL_DEMO_MODULE};

/// Every published release of the demo modules, oldest first.
pub const RELEASES: &[&str] =
    &["0.7", "0.8", "0.8.1", "0.9", "0.10", "0.11", "0.12", "0.13", "0.14", "1.0", "1.1"];

pub const LATEST_RELEASE: &str = "1.1";

pub(crate) fn with_releases(mut builder: CatalogBuilder) -> CatalogBuilder {
    for release in RELEASES {
        builder = builder.release(release);
    }
    builder
}

/// All catalogs shipped by this crate, in install order.
///
/// # Errors
/// Returns a [`CatalogError`] when a catalog is malformed.
pub fn catalogs() -> Result<Vec<TaskCatalog>, CatalogError> {
    Ok(vec![travel_demo_catalog()?, personalization_catalog()?])
}

/// Look up one catalog by module name.
///
/// # Errors
/// Returns a [`CatalogError`] when the catalog is malformed.
pub fn find_catalog(module: &str) -> Result<Option<TaskCatalog>, CatalogError> {
    Ok(catalogs()?.into_iter().find(|catalog| catalog.module() == module))
}
