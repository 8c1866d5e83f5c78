//! Ordered key/value byte vectors.
//!
//! Keys need not be unique and insertion order is preserved, since the
//! response echoes the request pairs back in the order they arrived.
//! Values are raw bytes; captured child output may be binary.

/// One `key=value` pair. Keys are conventionally ASCII, values arbitrary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// An ordered vector of key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvVec {
    pairs: Vec<KvPair>,
}

impl KvVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            pairs: Vec::with_capacity(n),
        }
    }

    /// Append a pair, preserving order.
    pub fn push(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.pairs.push(KvPair {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Value of the first pair with the given key.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_slice())
    }

    /// First value for `key`, lossily decoded for parsing textual fields.
    pub fn get_str(&self, key: &[u8]) -> Option<std::borrow::Cow<'_, str>> {
        self.get(key).map(String::from_utf8_lossy)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KvPair> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}

impl<K, V> FromIterator<(K, V)> for KvVec
where
    K: Into<Vec<u8>>,
    V: Into<Vec<u8>>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut kv = KvVec::new();
        for (k, v) in iter {
            kv.push(k, v);
        }
        kv
    }
}
