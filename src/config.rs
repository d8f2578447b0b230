//! Typed configuration of the resolver.
//!
//! Every recognized option is a named field of [`ResolverConfig`]. The
//! defaults are those of [`ResolverConfig::default`]; [`ResolverConfig::from_env`]
//! applies the usual environment overrides on top of them.

use std::{path::PathBuf, str::FromStr};

use const_format::concatcp;
use log::warn;

use crate::SYSCONFDIR;

/// The catalog consulted when nothing else is configured.
pub const DEFAULT_CATALOG: &str = concatcp!("file://", SYSCONFDIR, "/xml/catalog");

/// Directory below the home directory used by `cache_under_home`.
pub const HOME_CACHE_DIR: &str = ".xmlresolver.org/cache";

/// How strictly catalog documents are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatalogLoaderKind {
    /// Unknown elements are silently skipped.
    #[default]
    Lenient,
    /// Unknown elements in the catalog namespaces are reported.
    Strict,
}

impl FromStr for CatalogLoaderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" | "validating=false" => Ok(Self::Lenient),
            "strict" | "validating" | "validating=true" => Ok(Self::Strict),
            other => Err(format!("unknown catalog loader '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Ordered list of catalog files. Relative entries are resolved against
    /// the current working directory.
    pub catalog_files: Vec<String>,
    /// Default of the `prefer` attribute for catalogs that omit it.
    pub prefer_public: bool,
    /// Whether `oasis-xml-catalog` processing instructions may add document catalogs.
    pub allow_catalog_pi: bool,
    pub cache_directory: Option<PathBuf>,
    /// Use `~/.xmlresolver.org/cache` when `cache_directory` is unset.
    pub cache_under_home: bool,
    /// Compare `http:` and `https:` URIs as equal.
    pub merge_https: bool,
    /// Fall back to `uri` entries when a system identifier lookup fails.
    pub uri_for_system: bool,
    pub catalog_loader: CatalogLoaderKind,
    /// Search ZIP archives for a catalog when a catalog file is an archive.
    pub archived_catalogs: bool,
    /// Never consider cached resources expired.
    pub offline: bool,
    /// Catalog debug level, see [`crate::set_debug`].
    pub debug: i32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            catalog_files: vec![DEFAULT_CATALOG.to_owned()],
            prefer_public: true,
            allow_catalog_pi: true,
            cache_directory: None,
            cache_under_home: false,
            merge_https: true,
            uri_for_system: true,
            catalog_loader: CatalogLoaderKind::Lenient,
            archived_catalogs: true,
            offline: false,
            debug: 0,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl ResolverConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration reading every override through `lookup`.
    ///
    /// Values that cannot be parsed are reported and the default is kept.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(files) = lookup("XML_CATALOG_FILES") {
            config.catalog_files = files
                .split(|c: char| c.is_whitespace() || c == ';')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }

        let flags: [(&str, &mut bool); 7] = [
            ("XMLRESOLVER_PREFER_PUBLIC", &mut config.prefer_public),
            ("XMLRESOLVER_ALLOW_CATALOG_PI", &mut config.allow_catalog_pi),
            ("XMLRESOLVER_CACHE_UNDER_HOME", &mut config.cache_under_home),
            ("XMLRESOLVER_MERGE_HTTPS", &mut config.merge_https),
            ("XMLRESOLVER_URI_FOR_SYSTEM", &mut config.uri_for_system),
            ("XMLRESOLVER_ARCHIVED_CATALOGS", &mut config.archived_catalogs),
            ("XMLRESOLVER_FORCE_OFFLINE", &mut config.offline),
        ];
        for (name, field) in flags {
            if let Some(value) = lookup(name) {
                match parse_bool(&value) {
                    Some(flag) => *field = flag,
                    None => warn!("{name}: ignoring non-boolean value '{value}'"),
                }
            }
        }

        if let Some(dir) = lookup("XMLRESOLVER_CACHE").filter(|dir| !dir.is_empty()) {
            config.cache_directory = Some(PathBuf::from(dir));
        }
        if let Some(kind) = lookup("XMLRESOLVER_CATALOG_LOADER") {
            match kind.parse() {
                Ok(kind) => config.catalog_loader = kind,
                Err(e) => warn!("XMLRESOLVER_CATALOG_LOADER: {e}"),
            }
        }
        if let Some(level) = lookup("XML_DEBUG_CATALOG") {
            // Any non-numeric value enables level 1.
            config.debug = level.trim().parse().unwrap_or(1);
        }

        config
    }

    /// The directory the resource cache should live in, if any.
    pub fn effective_cache_directory(&self) -> Option<PathBuf> {
        self.cache_directory.clone().or_else(|| {
            self.cache_under_home
                .then(dirs::home_dir)
                .flatten()
                .map(|home| home.join(HOME_CACHE_DIR))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> ResolverConfig {
        let vars = vars
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect::<HashMap<_, _>>();
        ResolverConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_test() {
        let config = config_from(&[]);
        assert_eq!(config.catalog_files, vec![DEFAULT_CATALOG.to_owned()]);
        assert!(config.prefer_public);
        assert!(config.merge_https);
        assert!(config.uri_for_system);
        assert!(!config.offline);
        assert_eq!(config.catalog_loader, CatalogLoaderKind::Lenient);
        assert_eq!(config.effective_cache_directory(), None);
    }

    #[test]
    fn overrides_test() {
        let config = config_from(&[
            ("XML_CATALOG_FILES", "a.xml  file:///b.xml;c.xml"),
            ("XMLRESOLVER_PREFER_PUBLIC", "no"),
            ("XMLRESOLVER_FORCE_OFFLINE", "TRUE"),
            ("XMLRESOLVER_CACHE", "/var/cache/xml"),
            ("XMLRESOLVER_CATALOG_LOADER", "strict"),
            ("XML_DEBUG_CATALOG", ""),
        ]);
        assert_eq!(config.catalog_files, ["a.xml", "file:///b.xml", "c.xml"]);
        assert!(!config.prefer_public);
        assert!(config.offline);
        assert_eq!(config.catalog_loader, CatalogLoaderKind::Strict);
        assert_eq!(config.debug, 1);
        assert_eq!(
            config.effective_cache_directory(),
            Some(PathBuf::from("/var/cache/xml"))
        );
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let config = config_from(&[
            ("XMLRESOLVER_MERGE_HTTPS", "maybe"),
            ("XMLRESOLVER_CATALOG_LOADER", "fancy"),
        ]);
        assert!(config.merge_https);
        assert_eq!(config.catalog_loader, CatalogLoaderKind::Lenient);
    }
}
