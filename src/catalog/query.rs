//! The catalog query engine.
//!
//! A [`Query`] is matched against one catalog at a time by [`Query::lookup`].
//! [`Query::search`] drives it across the catalog list of a
//! [`CatalogManager`], following `nextCatalog` entries depth-first and
//! replacing the list the first time a lookup delegates.
//!
//! Reference: XML Catalogs, OASIS Standard V1.1, section 7.

use std::{
    borrow::Cow,
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use super::{CatalogManager, Entry, EntryCatalog, EntryData, EntryKind};
use crate::uri::{comparison_key, normalize_uri};

/// A request to resolve one kind of identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    System {
        system_id: String,
    },
    Public {
        system_id: Option<String>,
        public_id: String,
    },
    Uri {
        uri: String,
        nature: Option<String>,
        purpose: Option<String>,
    },
    Doctype {
        name: String,
        system_id: Option<String>,
        public_id: Option<String>,
    },
    Entity {
        name: String,
        system_id: Option<String>,
        public_id: Option<String>,
    },
    Notation {
        name: String,
        system_id: Option<String>,
        public_id: Option<String>,
    },
    Document,
}

/// The outcome of matching a query against one catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    /// Nothing matched in this catalog.
    Empty,
    /// The identifier maps to this absolute URI.
    Resolved(String),
    /// Continue with `query`, searching only `catalogs`.
    Delegate { query: Query, catalogs: Vec<String> },
}

impl QueryResult {
    pub fn resolved_uri(&self) -> Option<&str> {
        match self {
            Self::Resolved(uri) => Some(uri),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

fn starts_with_system(s: &str, prefix: &str) -> bool {
    if cfg!(windows) {
        s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    } else {
        s.starts_with(prefix)
    }
}

fn ends_with_system(s: &str, suffix: &str) -> bool {
    if cfg!(windows) {
        s.len() >= suffix.len()
            && s.as_bytes()[s.len() - suffix.len()..].eq_ignore_ascii_case(suffix.as_bytes())
    } else {
        s.ends_with(suffix)
    }
}

fn eq_system(a: &str, b: &str) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// `None` on either side matches anything.
fn wildcard_eq(query: Option<&str>, entry: Option<&str>) -> bool {
    match (query, entry) {
        (Some(query), Some(entry)) => query == entry,
        _ => true,
    }
}

/// Find the entry whose pattern is the longest prefix (or suffix) of `key`.
///
/// Only a strictly longer pattern displaces the current candidate, so the
/// first entry in document order wins ties. Returns the matched length with
/// the entry.
fn longest_match<'a>(
    entries: &'a [Arc<Entry>],
    key: &str,
    merge_https: bool,
    pattern: impl Fn(&EntryData) -> Option<&str>,
    matches: impl Fn(&str, &str) -> bool,
) -> Option<(usize, &'a Entry)> {
    let mut best: Option<(usize, &Entry)> = None;
    for entry in entries {
        let Some(pattern) = pattern(entry.data()) else {
            continue;
        };
        let pattern = comparison_key(pattern, merge_https);
        if matches(key, &*pattern) && best.is_none_or(|(len, _)| pattern.len() > len) {
            best = Some((pattern.len(), entry));
        }
    }
    best
}

/// Collect the catalogs of every matching delegate entry, longest prefix
/// first. Equal lengths keep document order and duplicates are dropped.
fn delegates(
    entries: &[Arc<Entry>],
    key: &str,
    merge_https: bool,
    pattern: impl Fn(&EntryData) -> Option<&str>,
    matches: impl Fn(&str, &str) -> bool,
) -> Vec<String> {
    let mut found = entries
        .iter()
        .filter_map(|entry| {
            let pattern = comparison_key(pattern(entry.data())?, merge_https);
            matches(key, &*pattern).then(|| (pattern.len(), entry.target_uri()))
        })
        .filter_map(|(len, catalog)| Some((len, catalog?.to_owned())))
        .collect::<Vec<_>>();
    found.sort_by(|l, r| r.0.cmp(&l.0));

    let mut seen = HashSet::new();
    found
        .into_iter()
        .map(|(_, catalog)| catalog)
        .filter(|catalog| seen.insert(catalog.clone()))
        .collect()
}

fn rewrite(entry: &Entry, key: &str, len: usize) -> Option<String> {
    Some(format!("{}{}", entry.target_uri()?, key.get(len..)?))
}

impl Query {
    /// Run this query over the catalogs of `manager`.
    ///
    /// A delegation replaces the remaining catalog list, once: the delegated
    /// query does not delegate again, so a `Delegate` it yields is treated as
    /// a miss. Returns either `Resolved` or `Empty`.
    pub fn search(&self, manager: &CatalogManager) -> QueryResult {
        let mut catalogs: VecDeque<String> = manager.catalogs().into();
        let mut query = Cow::Borrowed(self);
        let mut visited = HashSet::new();
        let mut delegated = false;

        while let Some(uri) = catalogs.pop_front() {
            if !visited.insert(uri.clone()) {
                catalog_debug!(1, "Catalog {uri} was already searched");
                continue;
            }
            let catalog = manager.load_catalog(&uri);
            match query.lookup(manager, &catalog) {
                QueryResult::Delegate {
                    query: next,
                    catalogs: list,
                } if !delegated => {
                    catalog_debug!(1, "Delegating {next:?} to {list:?}");
                    catalogs = list.into();
                    visited.clear();
                    query = Cow::Owned(next);
                    delegated = true;
                }
                QueryResult::Delegate { catalogs: list, .. } => {
                    catalog_debug!(1, "Not delegating {uri} to {list:?} again");
                    for next in catalog.next_catalogs().into_iter().rev() {
                        catalogs.push_front(next);
                    }
                }
                QueryResult::Empty => {
                    for next in catalog.next_catalogs().into_iter().rev() {
                        catalogs.push_front(next);
                    }
                }
                resolved => return resolved,
            }
        }
        QueryResult::Empty
    }

    /// Match this query against a single, fully loaded catalog.
    pub fn lookup(&self, manager: &CatalogManager, catalog: &EntryCatalog) -> QueryResult {
        match self {
            Self::System { system_id } => lookup_system(manager, catalog, system_id),
            Self::Public {
                system_id,
                public_id,
            } => lookup_public(manager, catalog, system_id.as_deref(), public_id),
            Self::Uri {
                uri,
                nature,
                purpose,
            } => lookup_uri(
                manager,
                catalog,
                uri,
                nature.as_deref(),
                purpose.as_deref(),
            ),
            Self::Doctype {
                name,
                system_id,
                public_id,
            } => lookup_named(
                manager,
                catalog,
                EntryKind::Doctype,
                name,
                system_id.as_deref(),
                public_id.as_deref(),
            ),
            Self::Entity {
                name,
                system_id,
                public_id,
            } => lookup_named(
                manager,
                catalog,
                EntryKind::Entity,
                name,
                system_id.as_deref(),
                public_id.as_deref(),
            ),
            Self::Notation {
                name,
                system_id,
                public_id,
            } => lookup_named(
                manager,
                catalog,
                EntryKind::Notation,
                name,
                system_id.as_deref(),
                public_id.as_deref(),
            ),
            Self::Document => catalog
                .entries_of(EntryKind::Document)
                .first()
                .and_then(|entry| entry.target_uri())
                .map_or(QueryResult::Empty, |uri| QueryResult::Resolved(uri.to_owned())),
        }
    }
}

fn lookup_system(manager: &CatalogManager, catalog: &EntryCatalog, system_id: &str) -> QueryResult {
    let merge_https = manager.config().merge_https;
    let normalized = normalize_uri(system_id);
    let key = comparison_key(&normalized, merge_https);

    for entry in catalog.entries_of(EntryKind::System) {
        if let EntryData::System {
            system_id: candidate,
            resource_uri,
        } = entry.data()
        {
            if eq_system(&comparison_key(candidate, merge_https), &key) {
                catalog_debug!(1, "Found system match {candidate}, using {resource_uri}");
                return QueryResult::Resolved(resource_uri.clone());
            }
        }
    }

    let rewrites = catalog.entries_of(EntryKind::RewriteSystem);
    let found = longest_match(
        &rewrites,
        &key,
        merge_https,
        |data| match data {
            EntryData::RewriteSystem {
                system_id_start, ..
            } => Some(system_id_start.as_str()),
            _ => None,
        },
        starts_with_system,
    );
    if let Some(uri) = found.and_then(|(len, entry)| rewrite(entry, &key, len)) {
        catalog_debug!(1, "Using rewriting rule for {system_id}: {uri}");
        return QueryResult::Resolved(uri);
    }

    let suffixes = catalog.entries_of(EntryKind::SystemSuffix);
    let found = longest_match(
        &suffixes,
        &key,
        merge_https,
        |data| match data {
            EntryData::SystemSuffix {
                system_id_suffix, ..
            } => Some(system_id_suffix.as_str()),
            _ => None,
        },
        ends_with_system,
    );
    if let Some(uri) = found.and_then(|(_, entry)| entry.target_uri()) {
        catalog_debug!(1, "Found system suffix match for {system_id}, using {uri}");
        return QueryResult::Resolved(uri.to_owned());
    }

    let catalogs = delegates(
        &catalog.entries_of(EntryKind::DelegateSystem),
        &key,
        merge_https,
        |data| match data {
            EntryData::DelegateSystem {
                system_id_start, ..
            } => Some(system_id_start.as_str()),
            _ => None,
        },
        starts_with_system,
    );
    if !catalogs.is_empty() {
        return QueryResult::Delegate {
            query: Query::System {
                system_id: system_id.to_owned(),
            },
            catalogs,
        };
    }

    if manager.config().uri_for_system {
        return lookup_uri(manager, catalog, system_id, None, None);
    }
    QueryResult::Empty
}

fn lookup_public(
    manager: &CatalogManager,
    catalog: &EntryCatalog,
    system_id: Option<&str>,
    public_id: &str,
) -> QueryResult {
    // A system delegation only applies once the public entries have missed.
    let mut system_delegate = None;
    if let Some(system_id) = system_id {
        match lookup_system(manager, catalog, system_id) {
            QueryResult::Empty => {}
            QueryResult::Resolved(uri) => return QueryResult::Resolved(uri),
            delegate => system_delegate = Some(delegate),
        }
    }

    // `prefer="system"` entries only apply when no system identifier is known.
    let eligible = |prefer_public: bool| prefer_public || system_id.is_none();

    for entry in catalog.entries_of(EntryKind::Public) {
        if let EntryData::Public {
            public_id: candidate,
            resource_uri,
            prefer_public,
        } = entry.data()
        {
            if eligible(*prefer_public) && candidate == public_id {
                catalog_debug!(1, "Found public match {candidate}, using {resource_uri}");
                return QueryResult::Resolved(resource_uri.clone());
            }
        }
    }

    let catalogs = delegates(
        &catalog.entries_of(EntryKind::DelegatePublic),
        public_id,
        false,
        |data| match data {
            EntryData::DelegatePublic {
                public_id_start,
                prefer_public,
                ..
            } if eligible(*prefer_public) => Some(public_id_start.as_str()),
            _ => None,
        },
        |key, start| key.starts_with(start),
    );
    if !catalogs.is_empty() {
        return QueryResult::Delegate {
            query: Query::Public {
                system_id: None,
                public_id: public_id.to_owned(),
            },
            catalogs,
        };
    }
    system_delegate.unwrap_or(QueryResult::Empty)
}

fn lookup_uri(
    manager: &CatalogManager,
    catalog: &EntryCatalog,
    uri: &str,
    nature: Option<&str>,
    purpose: Option<&str>,
) -> QueryResult {
    let merge_https = manager.config().merge_https;
    let normalized = normalize_uri(uri);
    let key = comparison_key(&normalized, merge_https);

    for entry in catalog.entries_of(EntryKind::Uri) {
        if let EntryData::Uri {
            name,
            resource_uri,
            nature: entry_nature,
            purpose: entry_purpose,
        } = entry.data()
        {
            if comparison_key(name, merge_https) == key
                && wildcard_eq(nature, entry_nature.as_deref())
                && wildcard_eq(purpose, entry_purpose.as_deref())
            {
                catalog_debug!(1, "Found uri match {name}, using {resource_uri}");
                return QueryResult::Resolved(resource_uri.clone());
            }
        }
    }

    let rewrites = catalog.entries_of(EntryKind::RewriteUri);
    let found = longest_match(
        &rewrites,
        &key,
        merge_https,
        |data| match data {
            EntryData::RewriteUri { uri_start, .. } => Some(uri_start.as_str()),
            _ => None,
        },
        |key, start| key.starts_with(start),
    );
    if let Some(uri) = found.and_then(|(len, entry)| rewrite(entry, &key, len)) {
        catalog_debug!(1, "Using rewriting rule for {key}: {uri}");
        return QueryResult::Resolved(uri);
    }

    let suffixes = catalog.entries_of(EntryKind::UriSuffix);
    let found = longest_match(
        &suffixes,
        &key,
        merge_https,
        |data| match data {
            EntryData::UriSuffix { uri_suffix, .. } => Some(uri_suffix.as_str()),
            _ => None,
        },
        |key, suffix| key.ends_with(suffix),
    );
    if let Some(resolved) = found.and_then(|(_, entry)| entry.target_uri()) {
        catalog_debug!(1, "Found uri suffix match for {key}, using {resolved}");
        return QueryResult::Resolved(resolved.to_owned());
    }

    let catalogs = delegates(
        &catalog.entries_of(EntryKind::DelegateUri),
        &key,
        merge_https,
        |data| match data {
            EntryData::DelegateUri { uri_start, .. } => Some(uri_start.as_str()),
            _ => None,
        },
        |key, start| key.starts_with(start),
    );
    if !catalogs.is_empty() {
        return QueryResult::Delegate {
            query: Query::Uri {
                uri: uri.to_owned(),
                nature: nature.map(str::to_owned),
                purpose: purpose.map(str::to_owned),
            },
            catalogs,
        };
    }
    QueryResult::Empty
}

/// Doctype, entity and notation queries try the external identifier first and
/// then the entries of their own kind.
fn lookup_named(
    manager: &CatalogManager,
    catalog: &EntryCatalog,
    kind: EntryKind,
    name: &str,
    system_id: Option<&str>,
    public_id: Option<&str>,
) -> QueryResult {
    let result = match (public_id, system_id) {
        (Some(public_id), system_id) => lookup_public(manager, catalog, system_id, public_id),
        (None, Some(system_id)) => lookup_system(manager, catalog, system_id),
        (None, None) => QueryResult::Empty,
    };
    if !result.is_empty() {
        return result;
    }

    for entry in catalog.entries_of(kind) {
        let candidate = match entry.data() {
            EntryData::Doctype { name: candidate, .. }
            | EntryData::Entity { name: candidate, .. }
            | EntryData::Notation { name: candidate, .. } => candidate,
            _ => continue,
        };
        if candidate == name {
            if let Some(uri) = entry.target_uri() {
                catalog_debug!(1, "Found {} match {name}, using {uri}", kind.element_name());
                return QueryResult::Resolved(uri.to_owned());
            }
        }
    }
    QueryResult::Empty
}
