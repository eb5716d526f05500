//! Small helpers shared across decode phases

/// Whether `name` is usable as a graph-dependency key: letters, digits,
/// underscores and dashes, starting with a letter.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Closest candidate to `name`, if any is close enough to be a likely typo.
pub(crate) fn did_you_mean<'a>(
    name: &str,
    candidates: impl IntoIterator<Item = &'a str>,
) -> Option<&'a str> {
    let mut best: Option<(usize, &str)> = None;
    for candidate in candidates {
        let distance = levenshtein_distance(name, candidate);
        if best.map(|(d, _)| distance < d).unwrap_or(true) {
            best = Some((distance, candidate));
        }
    }

    let (distance, candidate) = best?;
    let max_len = name.len().max(candidate.len());
    let threshold = if max_len <= 5 { 1 } else { 2 };
    (distance > 0 && distance <= threshold).then_some(candidate)
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<_> = a.chars().collect();
    let b_chars: Vec<_> = b.chars().collect();

    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    let mut current = vec![0; b_chars.len() + 1];

    for (i, a_char) in a_chars.iter().enumerate() {
        current[0] = i + 1;
        for (j, b_char) in b_chars.iter().enumerate() {
            let substitution = previous[j] + usize::from(a_char != b_char);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b_chars.len()]
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn identifier_rules() {
        assert!(is_valid_identifier("my-source_1"));
        assert!(!is_valid_identifier("1source"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("a.b"));
    }

    #[test]
    fn distances() {
        assert_eq!(levenshtein_distance("hello", "hello"), 0);
        assert_eq!(levenshtein_distance("hello", "hallo"), 1);
        assert_eq!(levenshtein_distance("", "abc"), 3);
    }

    #[test]
    fn suggestions() {
        assert_eq!(
            did_you_mean("amazon-eb", ["amazon-ebs", "null"]),
            Some("amazon-ebs")
        );
        assert_eq!(did_you_mean("docker", ["amazon-ebs", "null"]), None);
        // exact matches are not typos
        assert_eq!(did_you_mean("null", ["null"]), None);
    }
}
