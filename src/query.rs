//! Gmail-style search query parsing.
//!
//! `from:alice subject:"budget Q3" after:2025-01-01 folder:Archive cabbage`
//! becomes structured IMAP search criteria plus an optional folder override.
//! Unrecognized tokens are full-text terms. A known key with an empty value
//! or an unparsable date is a hard error; a second `folder:`/`label:` is
//! ignored silently.

use chrono::{NaiveDate, Utc};

use crate::error::{Error, Result};
use crate::imap::types::SearchCriteria;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub criteria: SearchCriteria,
    pub folder: Option<String>,
}

impl ParsedQuery {
    pub fn empty() -> Self {
        Self {
            criteria: SearchCriteria::And(Vec::new()),
            folder: None,
        }
    }
}

/// One lexed token: an optional recognized key and its (unquoted) value.
#[derive(Debug, PartialEq)]
struct Token {
    key: Option<String>,
    value: String,
}

const KEYS: &[&str] = &["from", "to", "subject", "after", "before", "folder", "label"];

/// Split on whitespace, keeping double-quoted runs intact. A known key
/// directly followed by `:` binds the rest of the token (possibly quoted) as
/// its value.
fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut raw = String::new();
        let mut in_quotes = false;
        while let Some(&c) = chars.peek() {
            if c == '"' {
                in_quotes = !in_quotes;
                chars.next();
                raw.push('"');
            } else if c.is_whitespace() && !in_quotes {
                break;
            } else {
                chars.next();
                raw.push(c);
            }
        }
        if in_quotes {
            return Err(Error::InvalidQuery("unterminated quote".to_string()));
        }

        tokens.push(split_token(&raw)?);
    }

    Ok(tokens)
}

fn split_token(raw: &str) -> Result<Token> {
    let colon = raw.find(':');
    let quote = raw.find('"');

    // A key must sit before any quoted material: `from:"a b"` has a key,
    // `"from: x"` does not.
    if let Some(colon_pos) = colon {
        if quote.map_or(true, |q| colon_pos < q) {
            let key = raw[..colon_pos].to_ascii_lowercase();
            if KEYS.contains(&key.as_str()) {
                let value = unquote(&raw[colon_pos + 1..]);
                if value.is_empty() {
                    return Err(Error::InvalidQuery(format!("empty value for {}:", key)));
                }
                return Ok(Token {
                    key: Some(key),
                    value,
                });
            }
        }
    }

    Ok(Token {
        key: None,
        value: unquote(raw),
    })
}

fn unquote(raw: &str) -> String {
    raw.replace('"', "")
}

fn parse_date(key: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|_| Error::InvalidQuery(format!("invalid date for {}: {}", key, value)))
}

/// Parse a query string into criteria and an optional folder override.
pub fn parse_query(input: &str) -> Result<ParsedQuery> {
    let tokens = lex(input)?;

    let mut criteria = Vec::new();
    let mut folder: Option<String> = None;
    let mut text_terms: Vec<String> = Vec::new();

    for token in tokens {
        match token.key.as_deref() {
            Some("from") => criteria.push(SearchCriteria::From(token.value)),
            Some("to") => criteria.push(SearchCriteria::To(token.value)),
            Some("subject") => criteria.push(SearchCriteria::Subject(token.value)),
            Some("after") => {
                let date = parse_date("after", &token.value)?;
                let since = date
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is always valid")
                    .and_utc();
                criteria.push(SearchCriteria::Since(since));
            }
            Some("before") => {
                let date = parse_date("before", &token.value)?;
                let end_of_day = date
                    .and_hms_opt(23, 59, 59)
                    .expect("end of day is always valid")
                    .and_utc();
                criteria.push(SearchCriteria::Before(end_of_day));
            }
            Some("folder") | Some("label") => {
                // First occurrence wins; later ones are ignored silently.
                if folder.is_none() {
                    folder = Some(token.value);
                }
            }
            Some(other) => {
                return Err(Error::InvalidQuery(format!("unhandled key: {}", other)));
            }
            None => {
                if !token.value.is_empty() {
                    text_terms.push(token.value);
                }
            }
        }
    }

    if !text_terms.is_empty() {
        criteria.push(SearchCriteria::Text(text_terms.join(" ")));
    }

    Ok(ParsedQuery {
        criteria: SearchCriteria::And(criteria),
        folder,
    })
}

fn quote_if_needed(value: &str) -> String {
    if value.contains(char::is_whitespace) {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

/// Inverse of [`parse_query`] up to quoting normalization:
/// `parse_query(render_query(q)) == q`.
pub fn render_query(query: &ParsedQuery) -> String {
    let mut parts = Vec::new();

    let criteria = match &query.criteria {
        SearchCriteria::And(list) => list.as_slice(),
        single => std::slice::from_ref(single),
    };

    let mut text = None;
    for criterion in criteria {
        match criterion {
            SearchCriteria::From(v) => parts.push(format!("from:{}", quote_if_needed(v))),
            SearchCriteria::To(v) => parts.push(format!("to:{}", quote_if_needed(v))),
            SearchCriteria::Subject(v) => parts.push(format!("subject:{}", quote_if_needed(v))),
            SearchCriteria::Since(d) => parts.push(format!("after:{}", d.format(DATE_FORMAT))),
            SearchCriteria::Before(d) => parts.push(format!("before:{}", d.format(DATE_FORMAT))),
            SearchCriteria::Text(v) => text = Some(v.clone()),
            SearchCriteria::All => {}
            SearchCriteria::And(_) => {}
        }
    }

    if let Some(folder) = &query.folder {
        parts.push(format!("folder:{}", quote_if_needed(folder)));
    }
    if let Some(text) = text {
        parts.push(text);
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_the_full_example() {
        let parsed = parse_query(
            r#"from:alice subject:"budget Q3" after:2025-01-01 folder:Archive cabbage"#,
        )
        .unwrap();

        assert_eq!(parsed.folder.as_deref(), Some("Archive"));
        let SearchCriteria::And(criteria) = &parsed.criteria else {
            panic!("expected And")
        };
        assert_eq!(criteria.len(), 4);
        assert_eq!(criteria[0], SearchCriteria::From("alice".to_string()));
        assert_eq!(criteria[1], SearchCriteria::Subject("budget Q3".to_string()));
        assert_eq!(
            criteria[2],
            SearchCriteria::Since(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(criteria[3], SearchCriteria::Text("cabbage".to_string()));
    }

    #[test]
    fn empty_query_is_empty_criteria() {
        let parsed = parse_query("").unwrap();
        assert_eq!(parsed, ParsedQuery::empty());
        assert_eq!(parsed.criteria.to_imap_string(), "ALL");
    }

    #[test]
    fn leftover_tokens_join_into_text() {
        let parsed = parse_query("red  cabbage   soup").unwrap();
        let SearchCriteria::And(criteria) = &parsed.criteria else {
            panic!("expected And")
        };
        assert_eq!(criteria, &[SearchCriteria::Text("red cabbage soup".to_string())]);
    }

    #[test]
    fn before_is_end_of_day() {
        let parsed = parse_query("before:2025-06-30").unwrap();
        let SearchCriteria::And(criteria) = &parsed.criteria else {
            panic!("expected And")
        };
        assert_eq!(
            criteria[0],
            SearchCriteria::Before(Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 59).unwrap())
        );
    }

    #[test]
    fn label_is_folder_synonym_first_wins() {
        let parsed = parse_query("label:Work folder:Archive").unwrap();
        assert_eq!(parsed.folder.as_deref(), Some("Work"));
    }

    #[test]
    fn trailing_colon_is_hard_error() {
        assert!(matches!(parse_query("from:"), Err(Error::InvalidQuery(_))));
        assert!(matches!(
            parse_query("subject: budget"),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn invalid_date_is_hard_error() {
        assert!(matches!(
            parse_query("after:tomorrow"),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            parse_query("before:2025-13-01"),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn unknown_colon_tokens_are_text() {
        let parsed = parse_query("http://example.com").unwrap();
        let SearchCriteria::And(criteria) = &parsed.criteria else {
            panic!("expected And")
        };
        assert_eq!(
            criteria,
            &[SearchCriteria::Text("http://example.com".to_string())]
        );
    }

    #[test]
    fn quoted_run_without_key_is_one_text_token() {
        let parsed = parse_query(r#""exact phrase here" extra"#).unwrap();
        let SearchCriteria::And(criteria) = &parsed.criteria else {
            panic!("expected And")
        };
        assert_eq!(
            criteria,
            &[SearchCriteria::Text("exact phrase here extra".to_string())]
        );
    }

    #[test]
    fn unterminated_quote_is_error() {
        assert!(matches!(
            parse_query(r#"subject:"oops"#),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn render_roundtrips_through_parse() {
        let original = parse_query(
            r#"from:alice to:bob subject:"budget Q3" after:2025-01-01 before:2025-06-30 folder:Archive cabbage soup"#,
        )
        .unwrap();

        let rendered = render_query(&original);
        let reparsed = parse_query(&rendered).unwrap();
        assert_eq!(reparsed, original);
    }

    #[test]
    fn render_of_empty_query_is_empty() {
        assert_eq!(render_query(&ParsedQuery::empty()), "");
    }
}
