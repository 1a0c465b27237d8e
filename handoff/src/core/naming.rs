//! Two-word slot names from a fixed phonetic vocabulary.
//!
//! Every slot carries a human-memorable name like `alfa-niner`. The
//! vocabulary is indexable by leading character, which gives operators a
//! two-character alias for free: `an` expands back to `alfa-niner`.

use rand::Rng;

use crate::error::{DeployError, Result};

/// Joins the two words of a slot name.
pub const SEPARATOR: char = '-';

/// ICAO spelling alphabet plus digit words, keyed by leading character.
const VOCABULARY: [(char, &str); 36] = [
    ('a', "alfa"),
    ('b', "bravo"),
    ('c', "charlie"),
    ('d', "delta"),
    ('e', "echo"),
    ('f', "foxtrot"),
    ('g', "golf"),
    ('h', "hotel"),
    ('i', "india"),
    ('j', "juliett"),
    ('k', "kilo"),
    ('l', "lima"),
    ('m', "mike"),
    ('n', "november"),
    ('o', "oscar"),
    ('p', "papa"),
    ('q', "quebec"),
    ('r', "romeo"),
    ('s', "sierra"),
    ('t', "tango"),
    ('u', "uniform"),
    ('v', "victor"),
    ('w', "whiskey"),
    ('x', "xray"),
    ('y', "yankee"),
    ('z', "zulu"),
    ('0', "zero"),
    ('1', "wun"),
    ('2', "too"),
    ('3', "tree"),
    ('4', "fower"),
    ('5', "five"),
    ('6', "six"),
    ('7', "seven"),
    ('8', "ait"),
    ('9', "niner"),
];

/// Mint a fresh two-word name.
///
/// Both words are picked independently (with replacement), so collisions with
/// existing slots are possible; minting is advisory and callers enforce
/// uniqueness where they need it.
pub fn mint(rng: &mut impl Rng) -> String {
    let first = VOCABULARY[rng.gen_range(0..VOCABULARY.len())].1;
    let second = VOCABULARY[rng.gen_range(0..VOCABULARY.len())].1;
    format!("{first}{SEPARATOR}{second}")
}

/// Expand a shortened alias into a full two-word name.
///
/// Names that already contain the separator pass through unchanged. Anything
/// else must be exactly two vocabulary characters.
pub fn resolve(alias: &str) -> Result<String> {
    if alias.contains(SEPARATOR) {
        validate_name(alias)?;
        return Ok(alias.to_string());
    }
    let chars: Vec<char> = alias.chars().collect();
    if chars.len() != 2 {
        return Err(DeployError::InvalidAlias {
            alias: alias.to_string(),
            reason: "expected two vocabulary characters or a full name".to_string(),
        });
    }
    let first = word_for(chars[0]).ok_or_else(|| no_word(alias, chars[0]))?;
    let second = word_for(chars[1]).ok_or_else(|| no_word(alias, chars[1]))?;
    Ok(format!("{first}{SEPARATOR}{second}"))
}

/// Validate that an explicit slot name is safe for use as a directory and
/// supervisor record name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DeployError::InvalidAlias {
            alias: name.to_string(),
            reason: "name must not be empty".to_string(),
        });
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == SEPARATOR))
    {
        return Err(DeployError::InvalidAlias {
            alias: name.to_string(),
            reason: format!("character '{bad}' not allowed (use [a-z0-9-])"),
        });
    }
    Ok(())
}

fn word_for(c: char) -> Option<&'static str> {
    VOCABULARY
        .iter()
        .find(|(key, _)| *key == c)
        .map(|(_, word)| *word)
}

fn no_word(alias: &str, c: char) -> DeployError {
    DeployError::InvalidAlias {
        alias: alias.to_string(),
        reason: format!("no vocabulary word for '{c}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn mint_produces_two_vocabulary_words() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let name = mint(&mut rng);
            let (first, second) = name.split_once(SEPARATOR).expect("separator");
            assert!(VOCABULARY.iter().any(|(_, w)| *w == first), "{first}");
            assert!(VOCABULARY.iter().any(|(_, w)| *w == second), "{second}");
        }
    }

    #[test]
    fn resolve_expands_two_letter_alias() {
        assert_eq!(resolve("ab").expect("resolve"), "alfa-bravo");
        assert_eq!(resolve("z9").expect("resolve"), "zulu-niner");
    }

    #[test]
    fn resolve_passes_full_names_through() {
        assert_eq!(resolve("alfa-bravo").expect("resolve"), "alfa-bravo");
    }

    #[test]
    fn resolve_rejects_wrong_length() {
        let err = resolve("zz9").unwrap_err();
        assert!(matches!(err, DeployError::InvalidAlias { .. }), "{err}");
    }

    #[test]
    fn resolve_rejects_unknown_character() {
        let err = resolve("a!").unwrap_err();
        assert!(matches!(err, DeployError::InvalidAlias { .. }), "{err}");
    }

    #[test]
    fn validate_name_rejects_uppercase_and_slashes() {
        assert!(validate_name("alfa-bravo").is_ok());
        assert!(validate_name("Alfa-bravo").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("").is_err());
    }
}
