//! Sort key compiler.
//!
//! Sort fields reuse the direction prefixes of the index vocabulary
//! (`field`, `+field`, `-field`); the only meaningful kind marker is
//! `$textScore:field`, which becomes a `$meta` sort entry. An empty field
//! name is a programmer error and panics at the call site, before any I/O.

use bson::{doc, Document};

/// Compiles an ordered list of sort tokens into a sort document.
///
/// # Panics
///
/// Panics if a token's field name is empty after stripping markers.
pub fn parse_sort_fields<S: AsRef<str>>(fields: &[S]) -> Document {
    let mut order = Document::new();
    for raw in fields {
        let mut field = raw.as_ref();
        let mut kind = "";
        if let Some(stripped) = field.strip_prefix('$') {
            if let Some(c) = stripped.find(':') {
                if c >= 1 && c + 1 < stripped.len() {
                    kind = &stripped[..c];
                    field = &stripped[c + 1..];
                }
            }
        }
        let mut n = 1_i32;
        if let Some(stripped) = field.strip_prefix('-') {
            n = -1;
            field = stripped;
        } else if let Some(stripped) = field.strip_prefix('+') {
            field = stripped;
        }
        if field.is_empty() {
            panic!("Sort: empty field name");
        }
        if kind == "textScore" {
            order.insert(field, doc! {"$meta": kind});
        } else {
            order.insert(field, n);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_and_meta_sort() {
        let order = parse_sort_fields(&["a", "-b", "+c", "$textScore:score"]);
        assert_eq!(
            order,
            doc! {"a": 1, "b": -1, "c": 1, "score": {"$meta": "textScore"}}
        );
    }

    #[test]
    #[should_panic(expected = "Sort: empty field name")]
    fn empty_field_panics() {
        parse_sort_fields(&[""]);
    }

    #[test]
    #[should_panic(expected = "Sort: empty field name")]
    fn bare_dash_panics() {
        parse_sort_fields(&["-"]);
    }
}
