//! Provide the catalog engine: entries, per-document catalogs, queries and the
//! manager that runs them across a list of catalog files.
//!
//! Reference: XML Catalogs, OASIS Standard V1.1, 7 October 2005.

pub mod entry;
pub mod loader;
pub mod manager;
pub mod query;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{error, warn};

pub use entry::{Entry, EntryData, EntryKind};
pub use loader::XmlCatalogLoader;
pub use manager::{CatalogLoader, CatalogManager};
pub use query::{Query, QueryResult};

use crate::error::{CatalogError, Result};

/// The namespace of OASIS XML Catalog elements.
pub const XML_CATALOGS_NAMESPACE: &str = "urn:oasis:names:tc:entity:xmlns:xml:catalog";
/// The namespace of the TR9401 extension elements.
pub const TR9401_NAMESPACE: &str = "urn:oasis:names:tc:entity:xmlns:tr9401:catalog";
/// Attributes in this namespace become entry properties.
pub const XMLRESOLVER_NAMESPACE: &str = "http://xmlresolver.org/ns/catalog";
/// The RDDL namespace, for `nature` and `purpose`.
pub const RDDL_NAMESPACE: &str = "http://www.rddl.org/";

#[derive(Debug, Default)]
struct CatalogEntries {
    entries: Vec<Arc<Entry>>,
    index: HashMap<EntryKind, Vec<Arc<Entry>>>,
}

/// The entries loaded from one catalog document, in document order.
///
/// Groups are flattened: a `group` contributes a `Group` entry followed by
/// its children.
#[derive(Debug)]
pub struct EntryCatalog {
    uri: String,
    base_uri: String,
    prefer_public: bool,
    inner: Mutex<CatalogEntries>,
}

fn required<'a>(
    element: &'static str,
    attribute: &'static str,
    value: Option<&'a str>,
) -> Result<String> {
    value
        .map(str::to_owned)
        .ok_or(CatalogError::MissingAttribute { element, attribute })
}

impl EntryCatalog {
    pub fn new(uri: impl Into<String>, base_uri: impl Into<String>, prefer_public: bool) -> Self {
        Self {
            uri: uri.into(),
            base_uri: base_uri.into(),
            prefer_public,
            inner: Mutex::new(CatalogEntries::default()),
        }
    }

    /// The URI this catalog was loaded from.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// The catalog-wide default of the `prefer` attribute.
    pub fn prefer_public(&self) -> bool {
        self.prefer_public
    }

    fn lock(&self) -> MutexGuard<'_, CatalogEntries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A snapshot of all entries in document order.
    pub fn entries(&self) -> Vec<Arc<Entry>> {
        self.lock().entries.clone()
    }

    /// A snapshot of the entries of `kind`, in document order.
    pub fn entries_of(&self, kind: EntryKind) -> Vec<Arc<Entry>> {
        self.lock().index.get(&kind).cloned().unwrap_or_default()
    }

    /// The catalogs named by `nextCatalog` entries, in document order.
    pub fn next_catalogs(&self) -> Vec<String> {
        self.entries_of(EntryKind::NextCatalog)
            .iter()
            .filter_map(|entry| entry.target_uri().map(str::to_owned))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an already constructed entry.
    pub fn push(&self, entry: Arc<Entry>) {
        let mut inner = self.lock();
        inner
            .index
            .entry(entry.kind())
            .or_default()
            .push(entry.clone());
        inner.entries.push(entry);
    }

    fn insert(&self, base_uri: &str, id: Option<&str>, data: Result<EntryData>) -> Option<Arc<Entry>> {
        match data.and_then(|data| Entry::new(base_uri, id, data)) {
            Ok(entry) => {
                let entry = Arc::new(entry);
                catalog_debug!(2, "Found {entry} in {}", self.uri);
                self.push(entry.clone());
                Some(entry)
            }
            Err(e @ CatalogError::MissingAttribute { .. }) => {
                warn!("{}: {e}", self.uri);
                None
            }
            Err(e) => {
                error!("{}: {e}", self.uri);
                None
            }
        }
    }

    pub fn add_group(&self, base_uri: &str, id: Option<&str>, prefer_public: bool) -> Option<Arc<Entry>> {
        self.insert(base_uri, id, Ok(EntryData::Group { prefer_public }))
    }

    pub fn add_public(
        &self,
        base_uri: &str,
        id: Option<&str>,
        public_id: Option<&str>,
        uri: Option<&str>,
        prefer_public: bool,
    ) -> Option<Arc<Entry>> {
        let data = required("public", "publicId", public_id).and_then(|public_id| {
            Ok(EntryData::Public {
                public_id,
                resource_uri: required("public", "uri", uri)?,
                prefer_public,
            })
        });
        self.insert(base_uri, id, data)
    }

    pub fn add_system(
        &self,
        base_uri: &str,
        id: Option<&str>,
        system_id: Option<&str>,
        uri: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("system", "systemId", system_id).and_then(|system_id| {
            Ok(EntryData::System {
                system_id,
                resource_uri: required("system", "uri", uri)?,
            })
        });
        self.insert(base_uri, id, data)
    }

    pub fn add_rewrite_system(
        &self,
        base_uri: &str,
        id: Option<&str>,
        system_id_start: Option<&str>,
        rewrite_prefix: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("rewriteSystem", "systemIdStartString", system_id_start).and_then(
            |system_id_start| {
                Ok(EntryData::RewriteSystem {
                    system_id_start,
                    rewrite_prefix: required("rewriteSystem", "rewritePrefix", rewrite_prefix)?,
                })
            },
        );
        self.insert(base_uri, id, data)
    }

    pub fn add_system_suffix(
        &self,
        base_uri: &str,
        id: Option<&str>,
        system_id_suffix: Option<&str>,
        uri: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("systemSuffix", "systemIdSuffix", system_id_suffix).and_then(
            |system_id_suffix| {
                Ok(EntryData::SystemSuffix {
                    system_id_suffix,
                    resource_uri: required("systemSuffix", "uri", uri)?,
                })
            },
        );
        self.insert(base_uri, id, data)
    }

    pub fn add_delegate_public(
        &self,
        base_uri: &str,
        id: Option<&str>,
        public_id_start: Option<&str>,
        catalog: Option<&str>,
        prefer_public: bool,
    ) -> Option<Arc<Entry>> {
        let data = required("delegatePublic", "publicIdStartString", public_id_start).and_then(
            |public_id_start| {
                Ok(EntryData::DelegatePublic {
                    public_id_start,
                    catalog_uri: required("delegatePublic", "catalog", catalog)?,
                    prefer_public,
                })
            },
        );
        self.insert(base_uri, id, data)
    }

    pub fn add_delegate_system(
        &self,
        base_uri: &str,
        id: Option<&str>,
        system_id_start: Option<&str>,
        catalog: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("delegateSystem", "systemIdStartString", system_id_start).and_then(
            |system_id_start| {
                Ok(EntryData::DelegateSystem {
                    system_id_start,
                    catalog_uri: required("delegateSystem", "catalog", catalog)?,
                })
            },
        );
        self.insert(base_uri, id, data)
    }

    pub fn add_uri(
        &self,
        base_uri: &str,
        id: Option<&str>,
        name: Option<&str>,
        uri: Option<&str>,
        nature: Option<&str>,
        purpose: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("uri", "name", name).and_then(|name| {
            Ok(EntryData::Uri {
                name,
                resource_uri: required("uri", "uri", uri)?,
                nature: nature.map(str::to_owned),
                purpose: purpose.map(str::to_owned),
            })
        });
        self.insert(base_uri, id, data)
    }

    pub fn add_rewrite_uri(
        &self,
        base_uri: &str,
        id: Option<&str>,
        uri_start: Option<&str>,
        rewrite_prefix: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("rewriteURI", "uriStartString", uri_start).and_then(|uri_start| {
            Ok(EntryData::RewriteUri {
                uri_start,
                rewrite_prefix: required("rewriteURI", "rewritePrefix", rewrite_prefix)?,
            })
        });
        self.insert(base_uri, id, data)
    }

    pub fn add_uri_suffix(
        &self,
        base_uri: &str,
        id: Option<&str>,
        uri_suffix: Option<&str>,
        uri: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("uriSuffix", "uriSuffix", uri_suffix).and_then(|uri_suffix| {
            Ok(EntryData::UriSuffix {
                uri_suffix,
                resource_uri: required("uriSuffix", "uri", uri)?,
            })
        });
        self.insert(base_uri, id, data)
    }

    pub fn add_delegate_uri(
        &self,
        base_uri: &str,
        id: Option<&str>,
        uri_start: Option<&str>,
        catalog: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("delegateURI", "uriStartString", uri_start).and_then(|uri_start| {
            Ok(EntryData::DelegateUri {
                uri_start,
                catalog_uri: required("delegateURI", "catalog", catalog)?,
            })
        });
        self.insert(base_uri, id, data)
    }

    pub fn add_next_catalog(
        &self,
        base_uri: &str,
        id: Option<&str>,
        catalog: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("nextCatalog", "catalog", catalog)
            .map(|catalog_uri| EntryData::NextCatalog { catalog_uri });
        self.insert(base_uri, id, data)
    }

    pub fn add_doctype(
        &self,
        base_uri: &str,
        id: Option<&str>,
        name: Option<&str>,
        uri: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("doctype", "name", name).and_then(|name| {
            Ok(EntryData::Doctype {
                name,
                resource_uri: required("doctype", "uri", uri)?,
            })
        });
        self.insert(base_uri, id, data)
    }

    pub fn add_document(&self, base_uri: &str, id: Option<&str>, uri: Option<&str>) -> Option<Arc<Entry>> {
        let data =
            required("document", "uri", uri).map(|resource_uri| EntryData::Document { resource_uri });
        self.insert(base_uri, id, data)
    }

    pub fn add_dtd_decl(
        &self,
        base_uri: &str,
        id: Option<&str>,
        public_id: Option<&str>,
        uri: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("dtddecl", "publicId", public_id).and_then(|public_id| {
            Ok(EntryData::DtdDecl {
                public_id,
                resource_uri: required("dtddecl", "uri", uri)?,
            })
        });
        self.insert(base_uri, id, data)
    }

    pub fn add_entity(
        &self,
        base_uri: &str,
        id: Option<&str>,
        name: Option<&str>,
        uri: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("entity", "name", name).and_then(|name| {
            Ok(EntryData::Entity {
                name,
                resource_uri: required("entity", "uri", uri)?,
            })
        });
        self.insert(base_uri, id, data)
    }

    pub fn add_linktype(
        &self,
        base_uri: &str,
        id: Option<&str>,
        name: Option<&str>,
        uri: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("linktype", "name", name).and_then(|name| {
            Ok(EntryData::Linktype {
                name,
                resource_uri: required("linktype", "uri", uri)?,
            })
        });
        self.insert(base_uri, id, data)
    }

    pub fn add_notation(
        &self,
        base_uri: &str,
        id: Option<&str>,
        name: Option<&str>,
        uri: Option<&str>,
    ) -> Option<Arc<Entry>> {
        let data = required("notation", "name", name).and_then(|name| {
            Ok(EntryData::Notation {
                name,
                resource_uri: required("notation", "uri", uri)?,
            })
        });
        self.insert(base_uri, id, data)
    }

    pub fn add_sgml_decl(&self, base_uri: &str, id: Option<&str>, uri: Option<&str>) -> Option<Arc<Entry>> {
        let data =
            required("sgmldecl", "uri", uri).map(|resource_uri| EntryData::SgmlDecl { resource_uri });
        self.insert(base_uri, id, data)
    }
}
