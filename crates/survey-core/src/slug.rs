//! URL-safe survey slugs
//!
//! [`slugify`] is pure. Uniqueness is enforced by the processor inside the
//! event transaction, trying [`candidate`] with increasing attempt numbers.

/// Maximum slug length before a collision suffix is appended
pub const MAX_SLUG_LEN: usize = 50;

/// Minimum useful slug length
pub const MIN_SLUG_LEN: usize = 3;

/// Prefix applied to slugs that come out too short
pub const FALLBACK_PREFIX: &str = "survey-";

/// Derive a slug from a survey title.
///
/// Lowercases, collapses every run of non `[a-z0-9]` characters into one
/// hyphen, and trims hyphens from both ends. Results shorter than
/// [`MIN_SLUG_LEN`] get [`FALLBACK_PREFIX`]; results longer than
/// [`MAX_SLUG_LEN`] are cut and lose any trailing hyphen.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_hyphen = false;

    for c in title.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    if slug.len() < MIN_SLUG_LEN {
        slug = format!("{}{}", FALLBACK_PREFIX, slug);
        // empty base leaves "survey-"
        slug.truncate(slug.trim_end_matches('-').len());
    }

    if slug.len() > MAX_SLUG_LEN {
        // ASCII only at this point, so byte truncation is safe
        slug.truncate(MAX_SLUG_LEN);
        slug.truncate(slug.trim_end_matches('-').len());
    }

    slug
}

/// The slug to try on the given attempt: `base`, then `base-2`, `base-3`, ...
pub fn candidate(base: &str, attempt: u32) -> String {
    if attempt <= 1 {
        base.to_string()
    } else {
        format!("{}-{}", base, attempt)
    }
}
