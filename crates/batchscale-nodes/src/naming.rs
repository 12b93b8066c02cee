//! Node name allocation.

use tracing::debug;

/// Next free name for `prefix` given the names currently in use.
///
/// Returns `prefix<max + 1>` over all `prefix<integer>` names, or
/// `prefix0` when none exist. Names whose suffix is not an integer are
/// ignored. Gaps left by earlier removals are never filled.
pub fn next_name<'a, I>(prefix: &str, names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut highest: Option<u64> = None;
    for name in names {
        let Some(suffix) = name.strip_prefix(prefix) else {
            continue;
        };
        match suffix.parse::<u64>() {
            Ok(n) if suffix.bytes().all(|b| b.is_ascii_digit()) => {
                highest = Some(highest.map_or(n, |h| h.max(n)));
            }
            _ => debug!(%name, %prefix, "ignoring node with non-numeric suffix"),
        }
    }

    match highest {
        Some(n) => format!("{prefix}{}", n + 1),
        None => format!("{prefix}0"),
    }
}
