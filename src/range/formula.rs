//! Decomposition of composed ion names ("Cu2Ni") into element/count
//! fragments, and the bijective matching used to resolve composite range rows
//! in ORNL files.

use nom::bytes::complete::{take_while, take_while_m_n};
use nom::character::complete::digit1;
use nom::combinator::{all_consuming, map_res, opt, recognize};
use nom::multi::many1;
use nom::sequence::pair;
use nom::IResult;

/// One `(element, multiplicity)` fragment of a composed name.
pub type Fragment = (String, usize);

// An element symbol starts with one uppercase ASCII letter and continues
// with lowercase letters; an optional decimal multiplier follows (1 when
// absent).
fn fragment(input: &str) -> IResult<&str, Fragment> {
    let (rest, symbol) = recognize(pair(
        take_while_m_n(1, 1, |c: char| c.is_ascii_uppercase()),
        take_while(|c: char| c.is_ascii_lowercase()),
    ))(input)?;
    let (rest, count) = opt(map_res(digit1, str::parse::<usize>))(rest)?;
    Ok((rest, (symbol.to_string(), count.unwrap_or(1))))
}

/// Splits a composed ion name into its fragments, eg `"AuHg2"` into
/// `[("Au", 1), ("Hg", 2)]`.
///
/// Returns `None` for names that are not a well-formed chemical formula:
/// non-ASCII input, a leading digit or lowercase letter, or any stray
/// character. The empty string decomposes to an empty fragment list.
pub fn decompose_ion_name(name: &str) -> Option<Vec<Fragment>> {
    if name.is_empty() {
        return Some(Vec::new());
    }
    if !name.is_ascii() {
        return None;
    }
    all_consuming(many1(fragment))(name)
        .ok()
        .map(|(_, fragments)| fragments)
}

/// Finds the unique candidate name whose decomposition matches `wanted`
/// fragment-for-fragment in both directions (order-free). Returns the index
/// into `candidates`, or `None` when no candidate — or more than one —
/// matches.
pub(crate) fn match_composed_name(
    candidates: &[(String, usize)],
    wanted: &[Fragment],
) -> Option<usize> {
    let decomposed: Vec<Vec<Fragment>> = candidates
        .iter()
        .map(|(name, _)| decompose_ion_name(name).unwrap_or_default())
        .collect();

    let mut matched: Option<usize> = None;
    for (i, fragments) in decomposed.iter().enumerate() {
        if fragments.is_empty() {
            continue;
        }
        let covers = wanted.iter().all(|f| fragments.contains(f));
        let covered = fragments.iter().all(|f| wanted.contains(f));
        if covers && covered {
            if matched.is_some() {
                // Ambiguous: two composed names both match
                return None;
            }
            matched = Some(candidates[i].1);
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("Cu", vec![("Cu", 1)])]
    #[case("Cu2Ni", vec![("Cu", 2), ("Ni", 1)])]
    #[case("AuHg2", vec![("Au", 1), ("Hg", 2)])]
    #[case("H2O", vec![("H", 2), ("O", 1)])]
    #[case("U235U238", vec![("U", 235), ("U", 238)])]
    fn decomposes(#[case] name: &str, #[case] expected: Vec<(&str, usize)>) {
        let expected: Vec<Fragment> = expected
            .into_iter()
            .map(|(s, n)| (s.to_string(), n))
            .collect();
        assert_eq!(decompose_ion_name(name), Some(expected));
    }

    #[rstest]
    #[case("2Cu")]
    #[case("cu")]
    #[case("Cu-Ni")]
    #[case("Cü")]
    fn rejects_malformed(#[case] name: &str) {
        assert_eq!(decompose_ion_name(name), None);
    }

    #[test]
    fn empty_name_is_empty_decomposition() {
        assert_eq!(decompose_ion_name(""), Some(Vec::new()));
    }

    #[test]
    fn matches_unique_candidate() {
        let candidates = vec![("Cu2Ni1".to_string(), 2usize), ("Zn".to_string(), 3)];
        let wanted = vec![("Cu".to_string(), 2), ("Ni".to_string(), 1)];
        assert_eq!(match_composed_name(&candidates, &wanted), Some(2));
    }

    #[test]
    fn rejects_ambiguous_and_missing() {
        let candidates = vec![("Cu2Ni".to_string(), 0usize), ("NiCu2".to_string(), 1)];
        let wanted = vec![("Cu".to_string(), 2), ("Ni".to_string(), 1)];
        // Both candidates decompose to the same multiset
        assert_eq!(match_composed_name(&candidates, &wanted), None);

        let candidates = vec![("Zn".to_string(), 0usize)];
        assert_eq!(match_composed_name(&candidates, &wanted), None);
    }

    #[test]
    fn superset_candidate_does_not_match() {
        // Candidate decomposes to a strict superset of the wanted fragments
        let candidates = vec![("Cu2NiZn".to_string(), 0usize)];
        let wanted = vec![("Cu".to_string(), 2), ("Ni".to_string(), 1)];
        assert_eq!(match_composed_name(&candidates, &wanted), None);
    }
}
