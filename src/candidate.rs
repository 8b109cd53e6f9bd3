/// Normalize a candidate query produced by a language model.
///
/// The first fenced code block (optionally tagged `sql`) is unwrapped if
/// present, surrounding whitespace is dropped, and a `;` is appended when
/// the text opens with an upper-case keyword and is not terminated yet.
pub fn clean_sql_query(raw: &str) -> String {
    let mut cleaned = fenced_block(raw).unwrap_or(raw).trim().to_string();

    let opens_with_keyword = cleaned
        .split_whitespace()
        .next()
        .is_some_and(|word| word.chars().count() > 1 && is_upper(word));
    if opens_with_keyword && !cleaned.ends_with(';') {
        cleaned.push(';');
    }
    cleaned
}

fn fenced_block(raw: &str) -> Option<&str> {
    let start = raw.find("```")? + 3;
    let len = raw[start..].find("```")?;
    let body = &raw[start..start + len];
    match body.get(..3) {
        Some(tag) if tag.eq_ignore_ascii_case("sql") => Some(&body[3..]),
        _ => Some(body),
    }
}

/// At least one cased character and no lower-case ones.
fn is_upper(word: &str) -> bool {
    word.chars().any(char::is_uppercase) && !word.chars().any(char::is_lowercase)
}
