use std::hash::Hash;
use std::marker::PhantomData;

/// Types that can be used as dense keys into a [RefVec] or [RefMap].
pub trait Ref: Into<usize> + From<usize> + Copy + PartialEq + Eq + Hash {}
impl<T> Ref for T where T: Into<usize> + From<usize> + Copy + PartialEq + Eq + Hash {}

/// Generates a newtype around a `NonZeroU32` suitable for use as a key type.
///
/// The niche lets the compiler represent `Option<K>` in 32 bits. The public
/// interface exposes plain `u32`/`usize` indices starting at 0.
#[macro_export]
macro_rules! create_ref_type {
    ($type_name:ident) => {
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $type_name(std::num::NonZeroU32);

        impl $type_name {
            pub fn new(id: u32) -> $type_name {
                $type_name(std::num::NonZeroU32::new(id + 1).expect("id overflow"))
            }
            pub fn to_u32(self) -> u32 {
                self.0.get() - 1
            }
        }
        impl From<usize> for $type_name {
            fn from(u: usize) -> Self {
                Self::new(u as u32)
            }
        }
        impl From<$type_name> for usize {
            fn from(v: $type_name) -> Self {
                v.to_u32() as usize
            }
        }
        impl From<u32> for $type_name {
            fn from(u: u32) -> Self {
                Self::new(u)
            }
        }
        impl From<$type_name> for u32 {
            fn from(v: $type_name) -> Self {
                v.to_u32()
            }
        }
        impl std::fmt::Debug for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", stringify!($type_name), self.to_u32())
            }
        }
    };
}

/// A vector indexed by typed keys, where keys are allocated densely on push.
#[derive(Clone)]
pub struct RefVec<K, V> {
    values: Vec<V>,
    phantom: PhantomData<K>,
}

impl<K, V> Default for RefVec<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RefVec<K, V> {
    pub fn new() -> Self {
        RefVec {
            values: Vec::new(),
            phantom: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Ref, V> RefVec<K, V> {
    /// The key that will be attributed by the next call to `push`.
    pub fn next_key(&self) -> K {
        K::from(self.values.len())
    }

    pub fn push(&mut self, value: V) -> K {
        let key = self.next_key();
        self.values.push(value);
        key
    }

    pub fn contains(&self, k: K) -> bool {
        k.into() < self.values.len()
    }

    pub fn get(&self, k: K) -> Option<&V> {
        self.values.get(k.into())
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        (0..self.values.len()).map(K::from)
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.values.iter()
    }

    pub fn entries(&self) -> impl Iterator<Item = (K, &V)> {
        self.values.iter().enumerate().map(|(i, v)| (K::from(i), v))
    }
}

impl<K: Ref, V> std::ops::Index<K> for RefVec<K, V> {
    type Output = V;
    fn index(&self, index: K) -> &Self::Output {
        &self.values[index.into()]
    }
}

impl<K: Ref, V> std::ops::IndexMut<K> for RefVec<K, V> {
    fn index_mut(&mut self, index: K) -> &mut Self::Output {
        &mut self.values[index.into()]
    }
}

impl<K: Ref, V: std::fmt::Debug> std::fmt::Debug for RefVec<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.values.iter()).finish()
    }
}

/// A sparse map from typed keys to values, backed by a vector of options.
#[derive(Clone)]
pub struct RefMap<K, V> {
    entries: Vec<Option<V>>,
    phantom: PhantomData<K>,
}

impl<K, V> Default for RefMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RefMap<K, V> {
    pub fn new() -> Self {
        RefMap {
            entries: Vec::new(),
            phantom: PhantomData,
        }
    }
}

impl<K: Ref, V> RefMap<K, V> {
    pub fn insert(&mut self, k: K, v: V) {
        let index = k.into();
        if self.entries.len() <= index {
            self.entries.resize_with(index + 1, || None);
        }
        self.entries[index] = Some(v);
    }

    pub fn remove(&mut self, k: K) -> Option<V> {
        let index: usize = k.into();
        if index < self.entries.len() {
            self.entries[index].take()
        } else {
            None
        }
    }

    pub fn contains(&self, k: K) -> bool {
        let index: usize = k.into();
        index < self.entries.len() && self.entries[index].is_some()
    }

    pub fn get(&self, k: K) -> Option<&V> {
        let index: usize = k.into();
        self.entries.get(index).and_then(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, k: K) -> Option<&mut V> {
        let index: usize = k.into();
        self.entries.get_mut(index).and_then(|e| e.as_mut())
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_some())
            .map(|(i, _)| K::from(i))
    }
}

impl<K: Ref, V> std::ops::Index<K> for RefMap<K, V> {
    type Output = V;
    fn index(&self, index: K) -> &Self::Output {
        self.get(index).expect("no such key")
    }
}

impl<K: Ref, V: std::fmt::Debug> std::fmt::Debug for RefMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.keys().map(|k| (k.into(), &self[k])))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    create_ref_type!(TestId);

    #[test]
    fn test_ref_vec() {
        let mut v: RefVec<TestId, char> = RefVec::new();
        let a = v.push('a');
        let b = v.push('b');
        assert_eq!(v[a], 'a');
        assert_eq!(v[b], 'b');
        assert_eq!(v.len(), 2);
        assert!(v.contains(a));
        assert!(!v.contains(TestId::new(7)));
        assert_eq!(v.next_key(), TestId::new(2));
        v[a] = 'z';
        assert_eq!(v[a], 'z');
        assert_eq!(v.keys().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_ref_map() {
        let mut m: RefMap<TestId, u32> = RefMap::new();
        let k = TestId::new(3);
        assert!(!m.contains(k));
        m.insert(k, 42);
        assert!(m.contains(k));
        assert_eq!(m[k], 42);
        assert_eq!(m.get(TestId::new(0)), None);
        assert_eq!(m.remove(k), Some(42));
        assert!(!m.contains(k));
    }

    #[test]
    fn test_niche() {
        assert_eq!(
            std::mem::size_of::<Option<TestId>>(),
            std::mem::size_of::<TestId>()
        );
    }
}
