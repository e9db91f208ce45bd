//! Tagged cache reads.

/// Result of a cache read: a stored value, or nothing stored under the key.
///
/// A hit may legitimately hold an empty or zero value; only `Miss` means
/// the tier has to be skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheSlot<T> {
    Hit(T),
    Miss,
}

impl<T> CacheSlot<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheSlot::Hit(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, CacheSlot::Miss)
    }

    pub fn hit(self) -> Option<T> {
        match self {
            CacheSlot::Hit(v) => Some(v),
            CacheSlot::Miss => None,
        }
    }

    pub fn as_ref(&self) -> CacheSlot<&T> {
        match self {
            CacheSlot::Hit(v) => CacheSlot::Hit(v),
            CacheSlot::Miss => CacheSlot::Miss,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> CacheSlot<U> {
        match self {
            CacheSlot::Hit(v) => CacheSlot::Hit(f(v)),
            CacheSlot::Miss => CacheSlot::Miss,
        }
    }
}

impl<T> From<Option<T>> for CacheSlot<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => CacheSlot::Hit(v),
            None => CacheSlot::Miss,
        }
    }
}
