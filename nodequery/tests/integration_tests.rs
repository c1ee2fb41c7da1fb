/// Integration tests for nodequery
///
/// These tests verify:
/// 1. Handle identity across independent lookups
/// 2. Serialization round trips
/// 3. Manipulation through the public traits
/// 4. Stale handle behaviour after removal
/// 5. Broadcast semantics on node sets
/// 6. CSS and XPath agreement
use anyhow::Result;
use nodequery::{
    css_to_xpath, Config, Document, ErrorKind, NodeManipulation, NodeQuery, NodeSet, SerializeOptions,
};
use tracing_subscriber::EnvFilter;

const LIBRARY: &str = r#"<library xmlns:dc="http://purl.org/dc/elements/1.1/">
  <book id="b1" class="novel classic"><dc:title>Emma</dc:title><year>1815</year></book>
  <book id="b2" class="novel"><dc:title>Dracula</dc:title><year>1897</year></book>
  <shelf><book id="b3"><dc:title>Walden</dc:title></book></shelf>
</library>"#;

/// Route library logs to the test output; filter with RUST_LOG
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tags(set: &NodeSet) -> Vec<String> {
    set.iter().filter_map(|n| n.tag().unwrap()).collect()
}

#[test]
fn test_identity_across_lookups() -> Result<()> {
    let doc = Document::parse(LIBRARY)?;
    let by_xpath = doc.query("//book[@id='b2']")?;
    let by_css = doc.css("#b2")?;
    let by_walk = doc.document_element()?.children()?[1].clone();

    assert_eq!(by_xpath[0].unique_key()?, by_css[0].unique_key()?);
    assert_eq!(by_css[0].unique_key()?, by_walk.unique_key()?);
    assert!(by_xpath[0].is_same_node(&by_walk));

    let first = doc.css("#b1")?;
    assert_ne!(first[0].unique_key()?, by_walk.unique_key()?);
    Ok(())
}

#[test]
fn test_serialization_round_trip() -> Result<()> {
    let doc = Document::parse(LIBRARY)?;
    let xml = doc.xml()?;
    assert_eq!(Document::parse(&xml)?.xml()?, xml);

    // subtree output stands alone with its namespace declarations
    let emma = doc.css("#b1")?[0].xml()?;
    let reparsed = Document::parse(&emma)?;
    assert_eq!(reparsed.xml()?, emma);
    assert!(emma.contains(r#"xmlns:dc="http://purl.org/dc/elements/1.1/""#));
    Ok(())
}

#[test]
fn test_control_whitespace_round_trip_and_query() -> Result<()> {
    init_logging();
    let doc = Document::parse("<a k=\"x&#10;y\">p&#13;q</a>")?;
    let xml = doc.xml()?;
    assert_eq!(Document::parse(&xml)?.xml()?, xml);

    let a = doc.document_element()?;
    assert_eq!(a.attribute("k")?.as_deref(), Some("x\ny"));
    assert_eq!(doc.query("//a[contains(@k, codepoints-to-string(10))]")?.len(), 1);
    assert_eq!(doc.query("//a[contains(., codepoints-to-string(13))]")?.len(), 1);
    Ok(())
}

#[test]
fn test_append_and_prepend_order() -> Result<()> {
    let doc = Document::parse("<a><b/><c/></a>")?;
    let a = doc.document_element()?;

    let added = a.append("<d/>")?;
    assert_eq!(tags(&added), vec!["d"]);
    assert_eq!(tags(&a.children()?), vec!["b", "c", "d"]);

    let added = a.prepend("<x/><y/>")?;
    assert_eq!(tags(&added), vec!["x", "y"]);
    assert_eq!(tags(&a.children()?), vec!["x", "y", "b", "c", "d"]);
    Ok(())
}

#[test]
fn test_removed_nodes_become_stale() -> Result<()> {
    let doc = Document::parse("<a><b><c>text</c></b><d/></a>")?;
    let b = doc.css("b")?[0].clone();
    let c = doc.css("c")?[0].clone();
    b.remove()?;

    for handle in [&b, &c] {
        let err = handle.append("<e/>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleHandle);
        let err = handle.parent().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleHandle);
        assert_eq!(handle.last_error().map(|e| e.kind()), Some(ErrorKind::StaleHandle));
    }

    // reads still work on the removed subtree
    assert_eq!(c.text()?, "text");
    assert_eq!(b.xml()?, "<b><c>text</c></b>");
    assert_eq!(doc.xml()?, "<a><d/></a>");
    Ok(())
}

#[test]
fn test_missing_nodes_yield_empty_sets() -> Result<()> {
    let doc = Document::parse(LIBRARY)?;
    assert!(doc.query("//missing")?.is_empty());
    assert!(doc.css("missing > nothing")?.is_empty());
    assert_eq!(doc.css("#b1")?[0].attribute("missing")?, None);
    Ok(())
}

#[test]
fn test_attribute_set_and_remove() -> Result<()> {
    let doc = Document::parse("<a/>")?;
    let a = doc.document_element()?;
    a.set_attribute("id", "x")?;
    assert_eq!(a.attribute("id")?.as_deref(), Some("x"));
    assert_eq!(a.get("id")?.as_deref(), Some("x"));
    a.remove_attribute("id")?;
    assert_eq!(a.attribute("id")?, None);
    Ok(())
}

#[test]
fn test_remove_namespaces_recursively() -> Result<()> {
    let doc = Document::parse(r#"<ns:a xmlns:ns="urn:x"/>"#)?;
    doc.document_element()?.remove_namespaces()?;
    assert_eq!(doc.xml()?, "<a/>");

    let doc = Document::parse(r#"<ns:a xmlns:ns="urn:x"><ns:b><c xmlns="urn:y"/></ns:b></ns:a>"#)?;
    doc.remove_namespaces()?;
    assert_eq!(doc.xml()?, "<a><b><c/></b></a>");
    assert_eq!(doc.query("/a/b/c")?.len(), 1);
    Ok(())
}

#[test]
fn test_broadcast_partial_failure() -> Result<()> {
    init_logging();
    let doc = Document::parse("<r><a/><b/><c/></r>")?;
    let mut set = NodeSet::new();
    set.push(doc.css("a")?[0].clone());
    // a text node cannot receive children
    set.push(doc.document_element()?.append("text")?[0].clone());
    set.push(doc.css("c")?[0].clone());

    let err = set.append("<x/>").unwrap_err();
    assert_eq!(err.failed_index(), Some(1));
    assert_eq!(err.kind(), ErrorKind::InvalidNodeOperation);
    assert_eq!(set[1].last_error().map(|e| e.kind()), Some(ErrorKind::InvalidNodeOperation));
    assert_eq!(set[0].last_error(), None);
    assert_eq!(doc.xml()?, "<r><a><x/></a><b/><c/>text</r>");
    Ok(())
}

#[test]
fn test_css_matches_xpath_equivalent() -> Result<()> {
    let doc = Document::parse(LIBRARY)?;
    for selector in ["book", "library > book", ".novel", "book.classic", "#b3", "book + book", "shelf book", "[id]"] {
        let xpath = css_to_xpath(selector)?;
        assert_eq!(css_to_xpath(selector)?, xpath);
        let by_css = doc.css(selector)?;
        let by_xpath = doc.root().query(&xpath)?;
        assert_eq!(by_css.keys()?, by_xpath.keys()?, "selector {selector}");
    }
    assert_eq!(doc.css(".novel")?.len(), 2);
    assert_eq!(doc.css("book + book")?.len(), 1);
    Ok(())
}

#[test]
fn test_move_between_parents() -> Result<()> {
    init_logging();
    let doc = Document::parse("<r><from><i>1</i><i>2</i></from><to/></r>")?;
    let items = doc.css("from > i")?;
    let to = doc.css("to")?;
    let moved = to.append(&items)?;
    assert_eq!(moved.keys()?, items.keys()?);
    assert_eq!(doc.xml()?, "<r><from/><to><i>1</i><i>2</i></to></r>");
    Ok(())
}

#[test]
fn test_copy_between_documents() -> Result<()> {
    let source = Document::parse(r#"<s xmlns:q="urn:q"><q:item k="v"/></s>"#)?;
    let target = Document::parse("<t/>")?;
    let item = source.query("/s/*")?;
    target.document_element()?.append(&item)?;
    assert_eq!(target.xml()?, r#"<t><q:item xmlns:q="urn:q" k="v"/></t>"#);
    // source is untouched
    assert_eq!(source.query("/s/*")?.len(), 1);
    Ok(())
}

#[test]
fn test_config_drives_queries_and_output() -> Result<()> {
    let config = Config::from_json(
        r#"{"namespaces": {"dc": "http://purl.org/dc/elements/1.1/"},
            "serialize": {"pretty_print": true}}"#,
    )?;
    let doc = Document::parse_with_config("<r><a>x</a></r>", &config)?;
    assert_eq!(doc.xml()?.trim_end(), "<r>\n  <a>x</a>\n</r>");
    assert_eq!(doc.xml_with(&SerializeOptions::default())?, "<r><a>x</a></r>");

    let lib = Document::parse_with_config(LIBRARY, &config)?;
    assert_eq!(tags(&lib.query("//dc:title")?), vec!["title"; 3]);
    Ok(())
}
