//! Initial prompt templates.
//!
//! Templates carry a single `{query}` slot. Literal braces are written as
//! `{{` and `}}`; any other placeholder is an error.

use crate::errors::FlowError;

pub const QUERY_PLACEHOLDER: &str = "query";

enum Piece<'a> {
    Literal(&'a str),
    Brace(char),
    Query,
}

fn parse(template: &str) -> Result<Vec<Piece<'_>>, FlowError> {
    let mut pieces = Vec::new();
    let mut rest = template;
    let mut has_query = false;

    while let Some(idx) = rest.find(['{', '}']) {
        if idx > 0 {
            pieces.push(Piece::Literal(&rest[..idx]));
        }
        let tail = &rest[idx..];

        if tail.starts_with("{{") {
            pieces.push(Piece::Brace('{'));
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            pieces.push(Piece::Brace('}'));
            rest = &tail[2..];
        } else if tail.starts_with('}') {
            return Err(FlowError::TemplateError(format!(
                "single '}}' encountered at byte {}",
                template.len() - tail.len()
            )));
        } else {
            let close = tail.find('}').ok_or_else(|| {
                FlowError::TemplateError("unmatched '{' in prompt template".to_string())
            })?;
            let field = &tail[1..close];
            if field != QUERY_PLACEHOLDER {
                return Err(FlowError::TemplateError(format!(
                    "unknown placeholder '{{{}}}', only '{{{}}}' is supported",
                    field, QUERY_PLACEHOLDER
                )));
            }
            has_query = true;
            pieces.push(Piece::Query);
            rest = &tail[close + 1..];
        }
    }
    if !rest.is_empty() {
        pieces.push(Piece::Literal(rest));
    }

    if !has_query {
        return Err(FlowError::TemplateError(
            "prompt template has no '{query}' placeholder".to_string(),
        ));
    }
    Ok(pieces)
}

pub fn validate_template(template: &str) -> Result<(), FlowError> {
    parse(template).map(|_| ())
}

pub fn render_template(template: &str, query: &str) -> Result<String, FlowError> {
    let pieces = parse(template)?;
    let mut out = String::with_capacity(template.len() + query.len());
    for piece in pieces {
        match piece {
            Piece::Literal(s) => out.push_str(s),
            Piece::Brace(c) => out.push(c),
            Piece::Query => out.push_str(query),
        }
    }
    Ok(out)
}
