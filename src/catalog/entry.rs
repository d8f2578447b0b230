//! Catalog entries.
//!
//! An [`Entry`] is immutable once built, except for its extension properties.
//! Every URI it points at is made absolute against the entry's base URI when
//! it is constructed, and the identifiers it matches on are stored normalized.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{LazyLock, PoisonError, RwLock},
};

use log::warn;
use regex::Regex;

use crate::{
    error::{CatalogError, Result},
    uri::{is_absolute, is_urn_pubid, normalize_classpath, normalize_public, normalize_uri, resolve, unwrap_urn},
};

static PROPERTY_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z0-9_]+$").expect("property name pattern is valid"));

/// The type of a catalog entry. Entries are indexed by kind inside a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    Group,
    Public,
    System,
    RewriteSystem,
    SystemSuffix,
    DelegatePublic,
    DelegateSystem,
    Uri,
    RewriteUri,
    UriSuffix,
    DelegateUri,
    NextCatalog,
    Doctype,
    Document,
    DtdDecl,
    Entity,
    Linktype,
    Notation,
    SgmlDecl,
    Null,
}

impl EntryKind {
    /// The local name of the catalog element producing this kind of entry.
    pub fn element_name(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Public => "public",
            Self::System => "system",
            Self::RewriteSystem => "rewriteSystem",
            Self::SystemSuffix => "systemSuffix",
            Self::DelegatePublic => "delegatePublic",
            Self::DelegateSystem => "delegateSystem",
            Self::Uri => "uri",
            Self::RewriteUri => "rewriteURI",
            Self::UriSuffix => "uriSuffix",
            Self::DelegateUri => "delegateURI",
            Self::NextCatalog => "nextCatalog",
            Self::Doctype => "doctype",
            Self::Document => "document",
            Self::DtdDecl => "dtddecl",
            Self::Entity => "entity",
            Self::Linktype => "linktype",
            Self::Notation => "notation",
            Self::SgmlDecl => "sgmldecl",
            Self::Null => "#null",
        }
    }

    /// Get the entry kind for a given catalog element name.
    pub fn from_element_name(name: &str) -> Option<Self> {
        let kind = match name {
            "group" => Self::Group,
            "public" => Self::Public,
            "system" => Self::System,
            "rewriteSystem" => Self::RewriteSystem,
            "systemSuffix" => Self::SystemSuffix,
            "delegatePublic" => Self::DelegatePublic,
            "delegateSystem" => Self::DelegateSystem,
            "uri" => Self::Uri,
            "rewriteURI" => Self::RewriteUri,
            "uriSuffix" => Self::UriSuffix,
            "delegateURI" => Self::DelegateUri,
            "nextCatalog" => Self::NextCatalog,
            "doctype" => Self::Doctype,
            "document" => Self::Document,
            "dtddecl" => Self::DtdDecl,
            "entity" => Self::Entity,
            "linktype" => Self::Linktype,
            "notation" => Self::Notation,
            "sgmldecl" => Self::SgmlDecl,
            _ => return None,
        };
        Some(kind)
    }

    /// Check if this kind belongs to the TR9401 extension vocabulary.
    pub fn is_tr9401(self) -> bool {
        matches!(
            self,
            Self::Doctype
                | Self::Document
                | Self::DtdDecl
                | Self::Entity
                | Self::Linktype
                | Self::Notation
                | Self::SgmlDecl
        )
    }
}

/// The fields that distinguish each kind of entry.
///
/// When passed to [`Entry::new`], URI fields may be relative; the constructed
/// entry holds them resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryData {
    Group {
        prefer_public: bool,
    },
    Public {
        public_id: String,
        resource_uri: String,
        prefer_public: bool,
    },
    System {
        system_id: String,
        resource_uri: String,
    },
    RewriteSystem {
        system_id_start: String,
        rewrite_prefix: String,
    },
    SystemSuffix {
        system_id_suffix: String,
        resource_uri: String,
    },
    DelegatePublic {
        public_id_start: String,
        catalog_uri: String,
        prefer_public: bool,
    },
    DelegateSystem {
        system_id_start: String,
        catalog_uri: String,
    },
    Uri {
        name: String,
        resource_uri: String,
        nature: Option<String>,
        purpose: Option<String>,
    },
    RewriteUri {
        uri_start: String,
        rewrite_prefix: String,
    },
    UriSuffix {
        uri_suffix: String,
        resource_uri: String,
    },
    DelegateUri {
        uri_start: String,
        catalog_uri: String,
    },
    NextCatalog {
        catalog_uri: String,
    },
    Doctype {
        name: String,
        resource_uri: String,
    },
    Document {
        resource_uri: String,
    },
    DtdDecl {
        public_id: String,
        resource_uri: String,
    },
    Entity {
        name: String,
        resource_uri: String,
    },
    Linktype {
        name: String,
        resource_uri: String,
    },
    Notation {
        name: String,
        resource_uri: String,
    },
    SgmlDecl {
        resource_uri: String,
    },
    Null,
}

impl EntryData {
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Group { .. } => EntryKind::Group,
            Self::Public { .. } => EntryKind::Public,
            Self::System { .. } => EntryKind::System,
            Self::RewriteSystem { .. } => EntryKind::RewriteSystem,
            Self::SystemSuffix { .. } => EntryKind::SystemSuffix,
            Self::DelegatePublic { .. } => EntryKind::DelegatePublic,
            Self::DelegateSystem { .. } => EntryKind::DelegateSystem,
            Self::Uri { .. } => EntryKind::Uri,
            Self::RewriteUri { .. } => EntryKind::RewriteUri,
            Self::UriSuffix { .. } => EntryKind::UriSuffix,
            Self::DelegateUri { .. } => EntryKind::DelegateUri,
            Self::NextCatalog { .. } => EntryKind::NextCatalog,
            Self::Doctype { .. } => EntryKind::Doctype,
            Self::Document { .. } => EntryKind::Document,
            Self::DtdDecl { .. } => EntryKind::DtdDecl,
            Self::Entity { .. } => EntryKind::Entity,
            Self::Linktype { .. } => EntryKind::Linktype,
            Self::Notation { .. } => EntryKind::Notation,
            Self::SgmlDecl { .. } => EntryKind::SgmlDecl,
            Self::Null => EntryKind::Null,
        }
    }

    /// The URI-valued field this entry points at, if any.
    fn target_mut(&mut self) -> Option<&mut String> {
        match self {
            Self::Public { resource_uri, .. }
            | Self::System { resource_uri, .. }
            | Self::SystemSuffix { resource_uri, .. }
            | Self::Uri { resource_uri, .. }
            | Self::UriSuffix { resource_uri, .. }
            | Self::Doctype { resource_uri, .. }
            | Self::Document { resource_uri }
            | Self::DtdDecl { resource_uri, .. }
            | Self::Entity { resource_uri, .. }
            | Self::Linktype { resource_uri, .. }
            | Self::Notation { resource_uri, .. }
            | Self::SgmlDecl { resource_uri } => Some(resource_uri),
            Self::RewriteSystem { rewrite_prefix, .. } | Self::RewriteUri { rewrite_prefix, .. } => {
                Some(rewrite_prefix)
            }
            Self::DelegatePublic { catalog_uri, .. }
            | Self::DelegateSystem { catalog_uri, .. }
            | Self::DelegateUri { catalog_uri, .. }
            | Self::NextCatalog { catalog_uri } => Some(catalog_uri),
            Self::Group { .. } | Self::Null => None,
        }
    }

    fn normalize_keys(&mut self) {
        fn uri_key(key: &mut String) {
            let normalized = normalize_classpath(&normalize_uri(key)).into_owned();
            *key = normalized;
        }
        fn public_key(key: &mut String) {
            let normalized = match is_urn_pubid(key).then(|| unwrap_urn(key)).flatten() {
                Some(id) => normalize_public(&id).into_owned(),
                None => normalize_public(key).into_owned(),
            };
            *key = normalized;
        }

        match self {
            Self::System { system_id: key, .. }
            | Self::RewriteSystem { system_id_start: key, .. }
            | Self::SystemSuffix { system_id_suffix: key, .. }
            | Self::DelegateSystem { system_id_start: key, .. }
            | Self::Uri { name: key, .. }
            | Self::RewriteUri { uri_start: key, .. }
            | Self::UriSuffix { uri_suffix: key, .. }
            | Self::DelegateUri { uri_start: key, .. } => uri_key(key),
            Self::Public { public_id: key, .. }
            | Self::DelegatePublic { public_id_start: key, .. }
            | Self::DtdDecl { public_id: key, .. } => public_key(key),
            _ => {}
        }
    }
}

/// One entry of a catalog.
#[derive(Debug)]
pub struct Entry {
    base_uri: String,
    id: Option<String>,
    properties: RwLock<BTreeMap<String, String>>,
    data: EntryData,
}

impl Entry {
    /// Build an entry against `base_uri`.
    ///
    /// Returns `RelativeBaseUri` if `base_uri` is not absolute, and
    /// `UnresolvableUri` if the target URI cannot be made absolute.
    pub fn new(base_uri: &str, id: Option<&str>, mut data: EntryData) -> Result<Self> {
        if !is_absolute(base_uri) {
            return Err(CatalogError::RelativeBaseUri(base_uri.to_owned()));
        }
        if let Some(target) = data.target_mut() {
            let resolved = resolve(base_uri, target).ok_or_else(|| CatalogError::UnresolvableUri {
                uri: target.clone(),
                base: base_uri.to_owned(),
            })?;
            *target = resolved;
        }
        data.normalize_keys();
        Ok(Self {
            base_uri: base_uri.to_owned(),
            id: id.map(str::to_owned),
            properties: RwLock::new(BTreeMap::new()),
            data,
        })
    }

    /// The placeholder standing for an element the loader skips.
    pub fn null(base_uri: &str) -> Self {
        Self {
            base_uri: base_uri.to_owned(),
            id: None,
            properties: RwLock::new(BTreeMap::new()),
            data: EntryData::Null,
        }
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn kind(&self) -> EntryKind {
        self.data.kind()
    }

    pub fn data(&self) -> &EntryData {
        &self.data
    }

    /// The absolute URI this entry maps to: the resource, the rewrite prefix
    /// or the catalog to consult next.
    pub fn target_uri(&self) -> Option<&str> {
        match &self.data {
            EntryData::Public { resource_uri, .. }
            | EntryData::System { resource_uri, .. }
            | EntryData::SystemSuffix { resource_uri, .. }
            | EntryData::Uri { resource_uri, .. }
            | EntryData::UriSuffix { resource_uri, .. }
            | EntryData::Doctype { resource_uri, .. }
            | EntryData::Document { resource_uri }
            | EntryData::DtdDecl { resource_uri, .. }
            | EntryData::Entity { resource_uri, .. }
            | EntryData::Linktype { resource_uri, .. }
            | EntryData::Notation { resource_uri, .. }
            | EntryData::SgmlDecl { resource_uri } => Some(resource_uri),
            EntryData::RewriteSystem { rewrite_prefix, .. }
            | EntryData::RewriteUri { rewrite_prefix, .. } => Some(rewrite_prefix),
            EntryData::DelegatePublic { catalog_uri, .. }
            | EntryData::DelegateSystem { catalog_uri, .. }
            | EntryData::DelegateUri { catalog_uri, .. }
            | EntryData::NextCatalog { catalog_uri } => Some(catalog_uri),
            EntryData::Group { .. } | EntryData::Null => None,
        }
    }

    pub fn property(&self, name: &str) -> Option<String> {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// A snapshot of the extension properties.
    pub fn properties(&self) -> BTreeMap<String, String> {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set an extension property.
    ///
    /// Names must match `[A-Za-z0-9_]+`; other names are logged and ignored.
    /// Returns `true` if the property was stored.
    pub fn set_property(&self, name: &str, value: &str) -> bool {
        if !PROPERTY_NAME.is_match(name) {
            warn!("Ignoring invalid property name '{name}'");
            return false;
        }
        self.properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), value.to_owned());
        true
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.kind().element_name())?;
        match &self.data {
            EntryData::Public { public_id: key, .. }
            | EntryData::DtdDecl { public_id: key, .. }
            | EntryData::DelegatePublic { public_id_start: key, .. } => write!(f, " \"{key}\"")?,
            EntryData::System { system_id: key, .. }
            | EntryData::RewriteSystem { system_id_start: key, .. }
            | EntryData::SystemSuffix { system_id_suffix: key, .. }
            | EntryData::DelegateSystem { system_id_start: key, .. }
            | EntryData::Uri { name: key, .. }
            | EntryData::RewriteUri { uri_start: key, .. }
            | EntryData::UriSuffix { uri_suffix: key, .. }
            | EntryData::DelegateUri { uri_start: key, .. }
            | EntryData::Doctype { name: key, .. }
            | EntryData::Entity { name: key, .. }
            | EntryData::Linktype { name: key, .. }
            | EntryData::Notation { name: key, .. } => write!(f, " {key}")?,
            _ => {}
        }
        if let Some(target) = self.target_uri() {
            write!(f, " -> {target}")?;
        }
        write!(f, ">")
    }
}
