//! End-to-end behavior of the query layer: user query string in, IMAP
//! search criteria string out.

use vmail::query::{parse_query, render_query, ParsedQuery};

#[test]
fn full_query_becomes_imap_criteria() {
    let parsed = parse_query(
        r#"from:alice subject:"budget Q3" after:2025-01-01 before:2025-02-01 folder:Archive cabbage"#,
    )
    .unwrap();

    assert_eq!(parsed.folder.as_deref(), Some("Archive"));
    assert_eq!(
        parsed.criteria.to_imap_string(),
        "FROM \"alice\" SUBJECT \"budget Q3\" SINCE 01-Jan-2025 BEFORE 01-Feb-2025 TEXT \"cabbage\""
    );
}

#[test]
fn empty_query_searches_all_with_no_override() {
    let parsed = parse_query("").unwrap();
    assert_eq!(parsed.criteria.to_imap_string(), "ALL");
    assert!(parsed.folder.is_none());
}

#[test]
fn plain_words_are_full_text() {
    let parsed = parse_query("cabbage soup recipe").unwrap();
    assert_eq!(
        parsed.criteria.to_imap_string(),
        "TEXT \"cabbage soup recipe\""
    );
}

#[test]
fn quotes_inside_text_are_escaped_for_imap() {
    let parsed = parse_query(r#"subject:"say \ hi""#);
    // Backslash survives lexing into the value and is escaped on render.
    let parsed = parsed.unwrap();
    assert!(parsed.criteria.to_imap_string().contains("\\\\"));
}

#[test]
fn folder_override_does_not_leak_into_criteria() {
    let parsed = parse_query("folder:Archive").unwrap();
    assert_eq!(parsed.folder.as_deref(), Some("Archive"));
    assert_eq!(parsed.criteria.to_imap_string(), "ALL");
}

#[test]
fn render_parse_fixpoint() {
    let cases = [
        "from:alice",
        "to:bob subject:hello",
        r#"subject:"two words" soup"#,
        "after:2024-12-31 before:2025-01-31",
        "folder:Archive from:alice cabbage",
        "",
    ];

    for case in cases {
        let once = parse_query(case).unwrap();
        let rendered = render_query(&once);
        let twice = parse_query(&rendered).unwrap();
        assert_eq!(once, twice, "case {:?} rendered as {:?}", case, rendered);
    }
}

#[test]
fn render_of_empty_is_empty() {
    assert_eq!(render_query(&ParsedQuery::empty()), "");
}
