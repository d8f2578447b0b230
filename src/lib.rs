//! Resolve public identifiers, system identifiers, URIs and namespace names through
//! OASIS XML Catalogs, optionally backed by an on-disk cache of fetched resources.
//!
//! The entry point for most users is [`Resolver`], built from a [`ResolverConfig`].
//! Lower layers are public as well: [`catalog::CatalogManager`] runs the catalog
//! lookups alone, and [`cache::ResourceCache`] can be driven directly.
//!
//! ```no_run
//! use xmlresolver::{Resolver, ResolverConfig};
//!
//! let config = ResolverConfig {
//!     catalog_files: vec!["file:///etc/xml/catalog".to_owned()],
//!     ..Default::default()
//! };
//! let resolver = Resolver::new(config);
//! if let Ok(Some(resource)) = resolver.resolve_uri("http://www.w3.org/2001/xml.xsd", None) {
//!     println!("{}", resource.resolved_uri);
//! }
//! ```
#![warn(unused_mut)]
#![warn(unused_imports)]
#![warn(unused_variables)]

use std::sync::atomic::{AtomicI32, Ordering};

/// Emit a catalog trace message when the catalog debug level is at least `$level`.
macro_rules! catalog_debug {
    ($level:expr, $($arg:tt)*) => {
        if $crate::debug_level() >= $level {
            log::debug!($($arg)*);
        }
    };
}

#[cfg(feature = "cache")]
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod resolver;
pub mod resource;
pub mod uri;

pub use config::{CatalogLoaderKind, ResolverConfig};
pub use error::{CatalogError, Result};
pub use resolver::Resolver;
pub use resource::{ResolvedResource, ResourceFetcher};

pub const SYSCONFDIR: &str = if let Some(sysconfdir) = option_env!("SYSCONFDIR") {
    sysconfdir
} else {
    "/etc"
};

// used for debugging
static XML_DEBUG_CATALOGS: AtomicI32 = AtomicI32::new(0);

/// Used to set the debug level for catalog operation, 0 disables debugging,
/// 1 enables it.
///
/// Returns the previous value of the catalog debugging level.
pub fn set_debug(level: i32) -> i32 {
    XML_DEBUG_CATALOGS.swap(level.max(0), Ordering::AcqRel)
}

/// Returns the current catalog debugging level.
pub fn debug_level() -> i32 {
    XML_DEBUG_CATALOGS.load(Ordering::Relaxed)
}
