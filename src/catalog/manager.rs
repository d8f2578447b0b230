//! The catalog manager: loads catalog documents once and runs queries over
//! the configured catalog list.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};

use log::{info, warn};

use super::{EntryCatalog, Query, XmlCatalogLoader};
use crate::{
    config::ResolverConfig,
    set_debug,
    uri::{cwd_uri, is_absolute, normalize_public, path_to_uri, resolve, unwrap_urn},
};

/// Turns catalog documents into [`EntryCatalog`]s.
///
/// A loader never fails: a document that cannot be read or parsed yields an
/// empty catalog.
pub trait CatalogLoader: Send + Sync {
    /// Read and parse the catalog at `uri`.
    fn load_catalog(&self, uri: &str) -> EntryCatalog;
    /// Parse `bytes` as the catalog at `uri`.
    fn load_catalog_from(&self, uri: &str, bytes: &[u8]) -> EntryCatalog;
    fn prefer_public(&self) -> bool;
    fn set_prefer_public(&self, prefer_public: bool);
    fn archived_catalogs(&self) -> bool;
    fn set_archived_catalogs(&self, archived: bool);
}

/// Runs catalog lookups.
///
/// Clones share the loaded catalogs.
#[derive(Clone)]
pub struct CatalogManager {
    config: Arc<ResolverConfig>,
    loader: Arc<dyn CatalogLoader>,
    loaded: Arc<RwLock<HashMap<String, Arc<EntryCatalog>>>>,
    document_catalogs: Vec<String>,
}

/// Make a configured catalog location absolute.
fn absolutize(uri: &str) -> String {
    if is_absolute(uri) {
        return uri.to_owned();
    }
    let path = Path::new(uri);
    if path.is_absolute() {
        if let Some(uri) = path_to_uri(path) {
            return uri;
        }
    }
    cwd_uri()
        .and_then(|cwd| resolve(&cwd, uri))
        .unwrap_or_else(|| uri.to_owned())
}

impl CatalogManager {
    /// Build a manager that reads catalogs with an [`XmlCatalogLoader`].
    pub fn new(config: ResolverConfig) -> Self {
        let loader = Arc::new(XmlCatalogLoader::new(&config));
        Self::with_loader(config, loader)
    }

    pub fn with_loader(config: ResolverConfig, loader: Arc<dyn CatalogLoader>) -> Self {
        if config.debug > 0 {
            set_debug(config.debug);
        }
        loader.set_prefer_public(config.prefer_public);
        loader.set_archived_catalogs(config.archived_catalogs);
        Self {
            config: Arc::new(config),
            loader,
            loaded: Arc::new(RwLock::new(HashMap::new())),
            document_catalogs: vec![],
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn loader(&self) -> &Arc<dyn CatalogLoader> {
        &self.loader
    }

    /// A manager that searches `catalogs` before the configured ones, as
    /// requested by `oasis-xml-catalog` processing instructions.
    pub fn for_document(&self, catalogs: &[&str]) -> Self {
        let mut manager = self.clone();
        if !self.config.allow_catalog_pi {
            info!("Ignoring document catalogs {catalogs:?}: catalog PIs are not allowed");
            return manager;
        }
        manager
            .document_catalogs
            .extend(catalogs.iter().map(|uri| absolutize(uri)));
        manager
    }

    /// The catalog URIs to search, in order.
    pub fn catalogs(&self) -> Vec<String> {
        self.document_catalogs
            .iter()
            .cloned()
            .chain(self.config.catalog_files.iter().map(|uri| absolutize(uri)))
            .collect()
    }

    /// Get the catalog at `uri`, loading it on first use.
    pub fn load_catalog(&self, uri: &str) -> Arc<EntryCatalog> {
        if let Some(catalog) = self.cached(uri) {
            return catalog;
        }
        catalog_debug!(1, "Loading catalog {uri}");
        let catalog = Arc::new(self.loader.load_catalog(uri));
        self.remember(uri, catalog)
    }

    /// Get the catalog at `uri`, parsing `bytes` if it is not loaded yet.
    pub fn load_catalog_from(&self, uri: &str, bytes: &[u8]) -> Arc<EntryCatalog> {
        if let Some(catalog) = self.cached(uri) {
            return catalog;
        }
        let catalog = Arc::new(self.loader.load_catalog_from(uri, bytes));
        self.remember(uri, catalog)
    }

    fn cached(&self, uri: &str) -> Option<Arc<EntryCatalog>> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
    }

    // When two threads load the same catalog, the first one stored wins.
    fn remember(&self, uri: &str, catalog: Arc<EntryCatalog>) -> Arc<EntryCatalog> {
        self.loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(uri.to_owned())
            .or_insert(catalog)
            .clone()
    }

    fn search(&self, query: Query) -> Option<String> {
        catalog_debug!(1, "Resolving {query:?}");
        let result = query.search(self);
        let resolved = result.resolved_uri().map(str::to_owned);
        if resolved.is_none() {
            catalog_debug!(1, "No match for {query:?}");
        }
        resolved
    }

    /// Apply URN unwrapping and normalization to an external identifier.
    ///
    /// A `urn:publicid:` system identifier stands for a public identifier. If
    /// an explicit public identifier disagrees with it, the explicit one wins.
    fn normalize_external_id(
        system_id: Option<&str>,
        public_id: Option<&str>,
    ) -> (Option<String>, Option<String>) {
        let mut public_id = public_id.map(|id| match unwrap_urn(id) {
            Some(unwrapped) => normalize_public(&unwrapped).into_owned(),
            None => normalize_public(id).into_owned(),
        });
        let mut system_id = system_id.map(str::to_owned);

        if let Some(urn) = system_id.as_deref().and_then(unwrap_urn) {
            let urn = normalize_public(&urn).into_owned();
            match public_id.as_deref() {
                None => public_id = Some(urn),
                Some(explicit) if explicit != urn => {
                    warn!("urn:publicid: system identifier '{urn}' differs from public identifier '{explicit}', using the public identifier");
                }
                Some(_) => {}
            }
            system_id = None;
        }
        (system_id, public_id)
    }

    fn external_query(system_id: Option<String>, public_id: Option<String>) -> Option<Query> {
        match (system_id, public_id) {
            (system_id, Some(public_id)) => Some(Query::Public {
                system_id,
                public_id,
            }),
            (Some(system_id), None) => Some(Query::System { system_id }),
            (None, None) => None,
        }
    }

    /// Resolve a system identifier.
    pub fn lookup_system(&self, system_id: &str) -> Option<String> {
        let (system_id, public_id) = Self::normalize_external_id(Some(system_id), None);
        self.search(Self::external_query(system_id, public_id)?)
    }

    /// Resolve an external identifier made of an optional system identifier
    /// and a public identifier.
    pub fn lookup_public(&self, system_id: Option<&str>, public_id: &str) -> Option<String> {
        let (system_id, public_id) = Self::normalize_external_id(system_id, Some(public_id));
        self.search(Self::external_query(system_id, public_id)?)
    }

    /// Resolve a URI reference.
    pub fn lookup_uri(&self, uri: &str) -> Option<String> {
        self.lookup_namespace_uri(uri, None, None)
    }

    /// Resolve a namespace name, optionally restricted to one RDDL nature and
    /// purpose.
    pub fn lookup_namespace_uri(
        &self,
        uri: &str,
        nature: Option<&str>,
        purpose: Option<&str>,
    ) -> Option<String> {
        if let Some(public_id) = unwrap_urn(uri) {
            return self.search(Query::Public {
                system_id: None,
                public_id: normalize_public(&public_id).into_owned(),
            });
        }
        self.search(Query::Uri {
            uri: uri.to_owned(),
            nature: nature.map(str::to_owned),
            purpose: purpose.map(str::to_owned),
        })
    }

    pub fn lookup_doctype(
        &self,
        name: &str,
        system_id: Option<&str>,
        public_id: Option<&str>,
    ) -> Option<String> {
        let (system_id, public_id) = Self::normalize_external_id(system_id, public_id);
        self.search(Query::Doctype {
            name: name.to_owned(),
            system_id,
            public_id,
        })
    }

    pub fn lookup_entity(
        &self,
        name: &str,
        system_id: Option<&str>,
        public_id: Option<&str>,
    ) -> Option<String> {
        let (system_id, public_id) = Self::normalize_external_id(system_id, public_id);
        self.search(Query::Entity {
            name: name.to_owned(),
            system_id,
            public_id,
        })
    }

    pub fn lookup_notation(
        &self,
        name: &str,
        system_id: Option<&str>,
        public_id: Option<&str>,
    ) -> Option<String> {
        let (system_id, public_id) = Self::normalize_external_id(system_id, public_id);
        self.search(Query::Notation {
            name: name.to_owned(),
            system_id,
            public_id,
        })
    }

    /// The default document named by the first `document` entry found.
    pub fn lookup_document(&self) -> Option<String> {
        self.search(Query::Document)
    }
}
