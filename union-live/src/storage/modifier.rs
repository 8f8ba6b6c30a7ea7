//! Read-modify-write transforms.
//!
//! A [`Modifier`] turns the current value into the next one inside a single
//! write transaction. [`BucketModifier`] adds the hook the append protocol
//! needs when the current bucket reports [`StoreError::BucketFull`].

use super::store::StoreError;

/// Transform applied to the current value of a key.
pub trait Modifier: Send + 'static {
    /// Produce the new value, or an error to abort the transaction.
    fn apply(&self, current: &[u8]) -> Result<Vec<u8>, StoreError>;
}

/// A modifier for bucketed values that can start a new bucket.
pub trait BucketModifier: Modifier {
    /// Build the first value of a new bucket chained behind the bucket stored
    /// at `previous`.
    fn start_bucket(&self, previous: &[u8]) -> Result<Vec<u8>, StoreError>;
}

/// Replace the current value unconditionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overwrite(pub Vec<u8>);

impl Modifier for Overwrite {
    fn apply(&self, _current: &[u8]) -> Result<Vec<u8>, StoreError> {
        Ok(self.0.clone())
    }
}

impl<F> Modifier for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, StoreError> + Send + 'static,
{
    fn apply(&self, current: &[u8]) -> Result<Vec<u8>, StoreError> {
        self(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overwrite_ignores_current() {
        let m = Overwrite(b"new".to_vec());
        assert_eq!(m.apply(b"old").unwrap(), b"new");
        assert_eq!(m.apply(b"").unwrap(), b"new");
    }

    #[test]
    fn test_closure_modifier() {
        let double = |current: &[u8]| -> Result<Vec<u8>, StoreError> {
            Ok(current.iter().chain(current).copied().collect())
        };
        assert_eq!(double.apply(b"ab").unwrap(), b"abab");
    }
}
