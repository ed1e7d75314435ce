use {
    sha2::{Digest, Sha256},
    std::collections::BTreeMap,
};

/// Label values are capped at 63 characters, so hashes stored in labels are
/// shortened to this many hex digits.
pub const LABEL_HASH_LEN: usize = 32;

// This trait is implemented by things we can take a cryptographic hash of, such as strings and
// byte buffers.
pub trait CryptoHash {
    // Compute a cryptographic hash. The guarantees:
    //   1. For all `x`, `hash_str(x)` = `hash_str(x)`.
    //   1. For all known `x` and `y`, `x` != `y` implies `hash_str(x)` != `hash_str(y)`.
    fn crypto_hash(&self) -> String;
}

impl CryptoHash for str {
    fn crypto_hash(&self) -> String {
        hex::encode(Sha256::digest(self.as_bytes()))
    }
}

impl CryptoHash for String {
    fn crypto_hash(&self) -> String {
        hex::encode(Sha256::digest(self.as_bytes()))
    }
}

impl CryptoHash for [u8] {
    fn crypto_hash(&self) -> String {
        hex::encode(Sha256::digest(self))
    }
}

// Combine two strings into a hash. The guarantees:
//   1. For all `x` and `y`, `combine(x, y)` = `combine(x, y)`.
//   2. For all known `x1`, `x2`, `y1`, and `y2`,
//      `x1` != `x2` implies `combine(x1, y1)` != `combine(x2, y2)`.
//   3. For all known `x1`, `x2`, `y1`, and `y2`,
//      `y1` != `y2` implies `combine(x1, y1)` != `combine(x2, y2)`.
pub fn combine<X: CryptoHash + ?Sized, Y: CryptoHash + ?Sized>(x: &X, y: &Y) -> String {
    format!("{}{}", x.crypto_hash(), y.crypto_hash()).crypto_hash()
}

/// Hash of a Secret/ConfigMap data map. Keys are visited in sorted order
/// (`BTreeMap`), each key folded together with its value.
pub fn hash_data_map<V: AsRef<[u8]>>(data: &BTreeMap<String, V>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(combine(key.as_str(), value.as_ref()).as_bytes());
    }
    label_safe(&hex::encode(hasher.finalize()))
}

/// Shorten a hex digest so it fits in a label value.
pub fn label_safe(digest: &str) -> String {
    digest.chars().take(LABEL_HASH_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::{combine, hash_data_map, CryptoHash, LABEL_HASH_LEN};
    use std::collections::BTreeMap;

    #[test]
    fn hash_str_pure() {
        assert_eq!("foo".crypto_hash(), "foo".crypto_hash());
    }

    #[test]
    fn hash_str_not_constant() {
        assert_ne!("foo".crypto_hash(), "bar".crypto_hash());
    }

    #[test]
    fn combine_pure() {
        assert_eq!(combine("foo", "bar"), combine("foo", "bar"));
    }

    #[test]
    fn combine_first_different() {
        assert_ne!(combine("foo", "bar"), combine("foo", "baz"));
    }

    #[test]
    fn combine_concat() {
        assert_ne!(combine("foo", "bar"), combine("foob", "ar"));
    }

    #[test]
    fn data_map_hash_ignores_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("password".to_string(), b"s3cret".to_vec());
        a.insert("user".to_string(), b"admin".to_vec());
        let mut b = BTreeMap::new();
        b.insert("user".to_string(), b"admin".to_vec());
        b.insert("password".to_string(), b"s3cret".to_vec());
        assert_eq!(hash_data_map(&a), hash_data_map(&b));
    }

    #[test]
    fn data_map_hash_tracks_values_and_keys() {
        let mut a = BTreeMap::new();
        a.insert("password".to_string(), "one".to_string());
        let mut b = a.clone();
        b.insert("password".to_string(), "two".to_string());
        let mut c = BTreeMap::new();
        c.insert("passwd".to_string(), "one".to_string());
        assert_ne!(hash_data_map(&a), hash_data_map(&b));
        assert_ne!(hash_data_map(&a), hash_data_map(&c));
    }

    #[test]
    fn data_map_hash_fits_in_a_label() {
        let empty: BTreeMap<String, String> = BTreeMap::new();
        assert_eq!(hash_data_map(&empty).len(), LABEL_HASH_LEN);
    }
}
