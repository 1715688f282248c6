//! Model Control Tokens
//!
//! The XML-like sentinel tags the model embeds in its markdown output, plus
//! small helpers for pulling tagged content out of complete responses.
//! Incremental handling of these tags during streaming lives in the reply
//! parser and chunk processor.

/// Opens a file content block: `<PlandexBlock lang="..." path="...">`.
pub const BLOCK_OPEN_PREFIX: &str = "<PlandexBlock";

/// Closes a file content block.
pub const BLOCK_CLOSE_TAG: &str = "</PlandexBlock>";

/// Closes a move/remove/reset operation section.
pub const END_FILE_OPS_TAG: &str = "<EndPlandexFileOps/>";

/// Stop sequence passed to the model on planner requests.
pub const FINISH_STOP_SEQUENCE: &str = "<PlandexFinish/>";

/// Build validation verdict: the proposed update is correct as-is.
pub const CORRECT_TAG: &str = "<PlandexCorrect/>";

/// Build validation verdict: the proposed update has problems.
pub const INCORRECT_TAG: &str = "<PlandexIncorrect/>";

/// Extract the content of the first `<tag>...</tag>` pair, or "" if absent.
///
/// Tag contents are returned with a single leading/trailing newline stripped,
/// matching how the model wraps block tags on their own lines.
pub fn get_xml_content(content: &str, tag: &str) -> String {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);

    let Some(start) = content.find(&open) else {
        return String::new();
    };
    let body_start = start + open.len();
    let Some(end_rel) = content[body_start..].find(&close) else {
        return String::new();
    };

    let body = &content[body_start..body_start + end_rel];
    let body = body.strip_prefix('\n').unwrap_or(body);
    let body = body.strip_suffix('\n').unwrap_or(body);
    body.to_string()
}

/// Extract the contents of every `<tag>...</tag>` pair in order.
pub fn get_all_xml_content(content: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);

    let mut results = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find(&open) {
        let body_start = start + open.len();
        let Some(end_rel) = rest[body_start..].find(&close) else {
            break;
        };
        let body = &rest[body_start..body_start + end_rel];
        let body = body.strip_prefix('\n').unwrap_or(body);
        let body = body.strip_suffix('\n').unwrap_or(body);
        results.push(body.to_string());
        rest = &rest[body_start + end_rel + close.len()..];
    }

    results
}
