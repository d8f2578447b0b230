//! Catalog searches across several catalog documents.
//!
//! Catalogs are served from memory so that the order in which the search
//! visits them can be observed.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use xmlresolver::{
    ResolverConfig,
    catalog::{CatalogLoader, CatalogManager, EntryCatalog, Query, QueryResult, XmlCatalogLoader},
    uri::comparison_key,
};

const A: &str = "file:///cat/a.xml";
const B: &str = "file:///cat/b.xml";
const C: &str = "file:///cat/c.xml";
const D: &str = "file:///cat/d.xml";

struct MemoryLoader {
    docs: HashMap<String, String>,
    xml: XmlCatalogLoader,
    visited: Mutex<Vec<String>>,
}

impl CatalogLoader for MemoryLoader {
    fn load_catalog(&self, uri: &str) -> EntryCatalog {
        self.visited.lock().unwrap().push(uri.to_owned());
        let doc = self.docs.get(uri).map(String::as_str).unwrap_or_default();
        self.xml.load_catalog_from(uri, doc.as_bytes())
    }

    fn load_catalog_from(&self, uri: &str, bytes: &[u8]) -> EntryCatalog {
        self.xml.load_catalog_from(uri, bytes)
    }

    fn prefer_public(&self) -> bool {
        self.xml.prefer_public()
    }

    fn set_prefer_public(&self, prefer_public: bool) {
        self.xml.set_prefer_public(prefer_public);
    }

    fn archived_catalogs(&self) -> bool {
        self.xml.archived_catalogs()
    }

    fn set_archived_catalogs(&self, archived: bool) {
        self.xml.set_archived_catalogs(archived);
    }
}

fn catalog(body: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<catalog xmlns="urn:oasis:names:tc:entity:xmlns:xml:catalog">
{body}
</catalog>"#
    )
}

fn setup(search: &[&str], docs: &[(&str, &str)]) -> (CatalogManager, Arc<MemoryLoader>) {
    let config = ResolverConfig {
        catalog_files: search.iter().map(|uri| uri.to_string()).collect(),
        ..Default::default()
    };
    let loader = Arc::new(MemoryLoader {
        docs: docs
            .iter()
            .map(|&(uri, body)| (uri.to_owned(), catalog(body)))
            .collect(),
        xml: XmlCatalogLoader::new(&config),
        visited: Mutex::new(vec![]),
    });
    (CatalogManager::with_loader(config, loader.clone()), loader)
}

fn visited(loader: &MemoryLoader) -> Vec<String> {
    loader.visited.lock().unwrap().clone()
}

#[test]
fn system_entry_resolves_against_catalog_base() {
    let (manager, _) = setup(
        &[A],
        &[(A, r#"<system systemId="http://example.org/a.dtd" uri="a.dtd"/>"#)],
    );
    assert_eq!(
        manager.lookup_system("http://example.org/a.dtd").as_deref(),
        Some("file:///cat/a.dtd")
    );
    assert_eq!(manager.lookup_system("http://example.org/b.dtd"), None);
}

#[test]
fn absent_nature_and_purpose_match_anything() {
    let (manager, _) = setup(
        &[A],
        &[(A, r#"<uri name="urn:x" uri="x.xml" nature="n1" purpose="p1"/>"#)],
    );
    let expected = Some("file:///cat/x.xml");
    assert_eq!(manager.lookup_uri("urn:x").as_deref(), expected);
    assert_eq!(
        manager.lookup_namespace_uri("urn:x", Some("n1"), None).as_deref(),
        expected
    );
    assert_eq!(manager.lookup_namespace_uri("urn:x", Some("n2"), None), None);
    assert_eq!(manager.lookup_namespace_uri("urn:x", None, Some("p2")), None);
}

#[test]
fn delegate_public_names_the_delegate_catalogs() {
    let (manager, _) = setup(&[], &[]);
    let catalog = manager.load_catalog_from(
        A,
        catalog(r#"<delegatePublic publicIdStartString="-//Acme" catalog="sub.xml"/>"#).as_bytes(),
    );
    let query = Query::Public {
        system_id: None,
        public_id: "-//Acme//DTD Foo".to_owned(),
    };
    match query.lookup(&manager, &catalog) {
        QueryResult::Delegate { query: delegated, catalogs } => {
            assert_eq!(catalogs, ["file:///cat/sub.xml"]);
            assert_eq!(delegated, query);
        }
        other => panic!("expected a delegation, got {other:?}"),
    }
}

#[test]
fn longest_rewrite_prefix_wins_across_kinds() {
    let (manager, _) = setup(
        &[A],
        &[(
            A,
            r#"<rewriteSystem systemIdStartString="http://x.org/" rewritePrefix="short/"/>
<rewriteSystem systemIdStartString="http://x.org/dtd/" rewritePrefix="long/"/>
<rewriteSystem systemIdStartString="http://x.org/dtd/" rewritePrefix="tie/"/>
<rewriteURI uriStartString="http://x.org/xsd/" rewritePrefix="schemas/"/>
<rewriteURI uriStartString="http://x.org/" rewritePrefix="all/"/>"#,
        )],
    );
    assert_eq!(
        manager.lookup_system("http://x.org/dtd/a.dtd").as_deref(),
        Some("file:///cat/long/a.dtd")
    );
    assert_eq!(
        manager.lookup_system("http://x.org/other/b.dtd").as_deref(),
        Some("file:///cat/short/other/b.dtd")
    );
    assert_eq!(
        manager.lookup_uri("http://x.org/xsd/c.xsd").as_deref(),
        Some("file:///cat/schemas/c.xsd")
    );
}

#[test]
fn delegation_replaces_the_search_list() {
    let (manager, loader) = setup(
        &[A, B],
        &[
            (
                A,
                format!(r#"<delegateSystem systemIdStartString="http://x.org/" catalog="{D}"/>"#)
                    .as_str(),
            ),
            (B, r#"<system systemId="http://x.org/a.dtd" uri="b.dtd"/>"#),
            (D, r#"<system systemId="http://x.org/other.dtd" uri="d.dtd"/>"#),
        ],
    );
    assert_eq!(manager.lookup_system("http://x.org/a.dtd"), None);
    assert_eq!(visited(&loader), [A, D]);
}

#[test]
fn delegated_searches_resolve_in_the_delegate() {
    let (manager, _) = setup(
        &[A],
        &[
            (
                A,
                r#"<delegateURI uriStartString="http://x.org/" catalog="c.xml"/>
<delegateURI uriStartString="http://x.org/schemas/" catalog="d.xml"/>"#,
            ),
            (C, r#"<uri name="http://x.org/schemas/s.xsd" uri="from-c.xsd"/>"#),
            (D, r#"<uri name="http://x.org/schemas/s.xsd" uri="from-d.xsd"/>"#),
        ],
    );
    assert_eq!(
        manager.lookup_uri("http://x.org/schemas/s.xsd").as_deref(),
        Some("file:///cat/from-d.xsd")
    );
}

#[test]
fn delegated_queries_do_not_delegate_again() {
    let (manager, loader) = setup(
        &[A],
        &[
            (A, r#"<delegateSystem systemIdStartString="http://x.org/" catalog="b.xml"/>"#),
            (
                B,
                r#"<delegateSystem systemIdStartString="http://x.org/" catalog="c.xml"/>
<nextCatalog catalog="d.xml"/>"#,
            ),
            (C, r#"<system systemId="http://x.org/a.dtd" uri="from-c.dtd"/>"#),
            (D, r#"<system systemId="http://x.org/b.dtd" uri="from-d.dtd"/>"#),
        ],
    );
    assert_eq!(manager.lookup_system("http://x.org/a.dtd"), None);
    assert_eq!(visited(&loader), [A, B, D]);

    // The next catalogs of the delegate are still searched.
    assert_eq!(
        manager.lookup_system("http://x.org/b.dtd").as_deref(),
        Some("file:///cat/from-d.dtd")
    );
}

#[test]
fn public_entries_apply_after_a_system_delegate() {
    let (manager, loader) = setup(
        &[A],
        &[
            (
                A,
                r#"<delegateSystem systemIdStartString="http://x.org/" catalog="b.xml"/>
<public publicId="-//Example//DTD P//EN" uri="pub.dtd"/>"#,
            ),
            (B, ""),
        ],
    );
    assert_eq!(
        manager
            .lookup_public(Some("http://x.org/a.dtd"), "-//Example//DTD P//EN")
            .as_deref(),
        Some("file:///cat/pub.dtd")
    );
    assert_eq!(visited(&loader), [A]);

    assert_eq!(
        manager.lookup_public(Some("http://x.org/a.dtd"), "-//Example//DTD Q//EN"),
        None
    );
    assert_eq!(visited(&loader), [A, B]);
}

#[test]
fn next_catalogs_are_searched_depth_first() {
    let (manager, loader) = setup(
        &[A, B],
        &[
            (A, r#"<nextCatalog catalog="c.xml"/>"#),
            (B, r#"<system systemId="http://x.org/b.dtd" uri="b.dtd"/>"#),
            (C, r#"<nextCatalog catalog="d.xml"/>"#),
        ],
    );
    assert_eq!(manager.lookup_system("http://x.org/none.dtd"), None);
    assert_eq!(visited(&loader), [A, C, D, B]);

    assert_eq!(
        manager.lookup_system("http://x.org/b.dtd").as_deref(),
        Some("file:///cat/b.dtd")
    );
    // Already loaded.
    assert_eq!(visited(&loader).len(), 4);
}

#[test]
fn next_catalog_cycles_terminate() {
    let (manager, loader) = setup(
        &[A],
        &[
            (A, r#"<nextCatalog catalog="b.xml"/>"#),
            (B, r#"<nextCatalog catalog="a.xml"/>"#),
        ],
    );
    assert_eq!(manager.lookup_uri("http://x.org/a.xsd"), None);
    assert_eq!(visited(&loader), [A, B]);
}

#[test]
fn prefer_system_entries_need_no_system_identifier() {
    let (manager, _) = setup(
        &[A],
        &[(
            A,
            r#"<group prefer="system">
  <public publicId="-//Example//DTD S//EN" uri="s.dtd"/>
</group>
<public publicId="-//Example//DTD P//EN" uri="p.dtd"/>"#,
        )],
    );
    assert_eq!(
        manager.lookup_public(Some("http://x.org/unknown.dtd"), "-//Example//DTD S//EN"),
        None
    );
    assert_eq!(
        manager.lookup_public(None, "-//Example//DTD S//EN").as_deref(),
        Some("file:///cat/s.dtd")
    );
    assert_eq!(
        manager
            .lookup_public(Some("http://x.org/unknown.dtd"), "-//Example//DTD P//EN")
            .as_deref(),
        Some("file:///cat/p.dtd")
    );
}

#[test]
fn system_identifiers_win_over_public_ones() {
    let (manager, _) = setup(
        &[A],
        &[(
            A,
            r#"<system systemId="http://x.org/doc.dtd" uri="by-system.dtd"/>
<public publicId="-//Example//DTD Doc//EN" uri="by-public.dtd"/>"#,
        )],
    );
    assert_eq!(
        manager
            .lookup_public(Some("http://x.org/doc.dtd"), "-//Example//DTD Doc//EN")
            .as_deref(),
        Some("file:///cat/by-system.dtd")
    );
}

#[test]
fn classpath_and_https_keys() {
    assert_eq!(
        comparison_key("classpath:/a/b", false),
        comparison_key("classpath:a/b", false)
    );
    let once = comparison_key("classpath:/a/b", false).into_owned();
    assert_eq!(comparison_key(&once, false), once);
    assert_eq!(
        comparison_key("http://x.org/a", true),
        comparison_key("https://x.org/a", true)
    );
    assert_ne!(
        comparison_key("http://x.org/a", false),
        comparison_key("https://x.org/a", false)
    );

    let (manager, _) = setup(
        &[A],
        &[(A, r#"<uri name="https://x.org/s.xsd" uri="s.xsd"/>"#)],
    );
    assert_eq!(
        manager.lookup_uri("http://x.org/s.xsd").as_deref(),
        Some("file:///cat/s.xsd")
    );
}

#[test]
fn named_entries_fall_back_after_external_identifiers() {
    let (manager, _) = setup(
        &[A],
        &[(
            A,
            r#"<system systemId="http://x.org/ent.xml" uri="by-system.xml"/>"#,
        )],
    );
    assert_eq!(
        manager
            .lookup_entity("chapter", Some("http://x.org/ent.xml"), None)
            .as_deref(),
        Some("file:///cat/by-system.xml")
    );
    assert_eq!(manager.lookup_entity("chapter", None, None), None);
}

#[test]
fn tr9401_entries_are_looked_up_by_name() {
    let (manager, _) = setup(&[], &[]);
    let manager = manager.for_document(&[A]);
    let catalog = manager.load_catalog_from(
        A,
        br#"<catalog xmlns="urn:oasis:names:tc:entity:xmlns:xml:catalog"
         xmlns:tr="urn:oasis:names:tc:entity:xmlns:tr9401:catalog">
  <tr:entity name="chapter" uri="chapter.xml"/>
  <tr:doctype name="book" uri="book.dtd"/>
  <tr:notation name="png" uri="png.txt"/>
  <tr:document uri="start.xml"/>
</catalog>"#,
    );
    assert_eq!(catalog.entries().len(), 4);
    assert_eq!(
        manager.lookup_entity("chapter", None, None).as_deref(),
        Some("file:///cat/chapter.xml")
    );
    assert_eq!(
        manager.lookup_doctype("book", None, None).as_deref(),
        Some("file:///cat/book.dtd")
    );
    assert_eq!(
        manager.lookup_notation("png", None, None).as_deref(),
        Some("file:///cat/png.txt")
    );
    assert_eq!(manager.lookup_document().as_deref(), Some("file:///cat/start.xml"));
    assert_eq!(manager.lookup_entity("book", None, None), None);
}
