use std::path::Path;

pub const MAX_SUGGESTIONS: usize = 5;

fn stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_lowercase()
}

/// Rank `available` names as near misses for `wanted`: case-insensitive exact
/// matches first, then same stem with another extension, then stems that
/// contain each other. Pure; the input order breaks ties.
pub fn suggest<'a, I>(wanted: &str, available: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let wanted_lower = wanted.to_lowercase();
    let wanted_stem = stem(wanted);

    let mut ranked: Vec<(u8, &str)> = available
        .into_iter()
        .filter(|candidate| *candidate != wanted)
        .filter_map(|candidate| {
            let candidate_stem = stem(candidate);
            let rank = if candidate.to_lowercase() == wanted_lower {
                0
            } else if candidate_stem == wanted_stem {
                1
            } else if !wanted_stem.is_empty()
                && (candidate_stem.contains(&wanted_stem) || wanted_stem.contains(&candidate_stem))
                && !candidate_stem.is_empty()
            {
                2
            } else {
                return None;
            };
            Some((rank, candidate))
        })
        .collect();

    ranked.sort_by_key(|(rank, _)| *rank);
    let mut out: Vec<String> = Vec::new();
    for (_, name) in ranked {
        if !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
        if out.len() == MAX_SUGGESTIONS {
            break;
        }
    }
    out
}
