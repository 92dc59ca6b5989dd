/*!
 * Human-readable monikers for replica names
 *
 * Replica pod names embed a three-token moniker drawn from a fixed
 * dictionary (`<adjective>-<color>-<animal>`).  Callers check the drawn
 * moniker against names already in use and redraw on collision.
 */

use rand::seq::SliceRandom;
use rand::thread_rng;

const ADJECTIVES: &[&str] = &[
    "able", "brisk", "calm", "deft", "eager", "fond", "glad", "hale",
    "keen", "livid", "merry", "noble", "plucky", "quick", "stout", "witty",
];

const COLORS: &[&str] = &[
    "amber", "azure", "coral", "crimson", "ebony", "fuchsia", "indigo",
    "ivory", "jade", "mauve", "ochre", "olive", "russet", "sepia", "teal",
    "umber",
];

const ANIMALS: &[&str] = &[
    "badger", "bittern", "crane", "dingo", "egret", "ferret", "gannet",
    "heron", "ibis", "jackal", "kestrel", "lemur", "marmot", "newt",
    "osprey", "plover", "quail", "raven", "shrike", "tapir", "urchin",
    "vole", "wombat", "yak",
];

/** Draws one moniker at random. */
pub fn moniker() -> String {
    let mut rng = thread_rng();
    format!(
        "{}-{}-{}",
        ADJECTIVES.choose(&mut rng).unwrap(),
        COLORS.choose(&mut rng).unwrap(),
        ANIMALS.choose(&mut rng).unwrap(),
    )
}

#[cfg(test)]
mod test {
    use super::moniker;

    #[test]
    fn test_moniker_shape() {
        for _ in 0..100 {
            let m = moniker();
            let tokens: Vec<&str> = m.split('-').collect();
            assert_eq!(tokens.len(), 3);
            for token in tokens {
                assert!(!token.is_empty());
                assert!(token
                    .chars()
                    .all(|c| c.is_ascii_lowercase()));
            }
        }
    }
}
