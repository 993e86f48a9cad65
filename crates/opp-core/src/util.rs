//! Small shared helpers

/// Turn a friendly name into a valid object_id segment.
///
/// Lowercases, maps any run of non-alphanumeric characters to a single
/// underscore, and trims leading/trailing underscores.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_sep = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}
