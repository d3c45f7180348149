pub mod models;
pub mod permission;
pub mod release;

/// Keep only `[A-Za-z0-9_\-()]`, replacing everything else with `_`.
///
/// Used both for mirror directory names and for the lock files guarding them,
/// so a repository path always maps to the same on-disk identity.
pub fn filesystem_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '(' | ')' => c,
            _ => '_',
        })
        .collect()
}
