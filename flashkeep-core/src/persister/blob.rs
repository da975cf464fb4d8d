//! Postcard encoded persister

use serde::{de::DeserializeOwned, Serialize};

use super::{DecodeError, Persister};

/// Persister for any serde value, stored with postcard
///
/// Keeps the value together with its encoding in an `N` byte buffer, so
/// [`Persister::serialize`] can hand out a borrow without encoding on
/// demand. Every change goes through [`set`](Self::set) or
/// [`modify`](Self::modify) and re-encodes.
#[derive(Debug)]
pub struct PostcardBlob<T, const N: usize> {
    value: T,
    encoded: [u8; N],
    len: usize,
}

impl<T, const N: usize> PostcardBlob<T, N>
where
    T: Serialize + DeserializeOwned,
{
    /// Wrap an initial value
    pub fn new(value: T) -> Result<Self, postcard::Error> {
        let mut blob = Self {
            value,
            encoded: [0; N],
            len: 0,
        };
        blob.encode()?;
        Ok(blob)
    }

    /// Current value
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Replace the value
    ///
    /// On error the previous value and encoding are kept.
    pub fn set(&mut self, value: T) -> Result<(), postcard::Error> {
        let previous = core::mem::replace(&mut self.value, value);
        if let Err(e) = self.encode() {
            self.value = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Change the value in place and re-encode it
    ///
    /// If the new value does not fit, the value stays changed but
    /// [`Persister::serialize`] keeps returning the previous encoding.
    pub fn modify<F>(&mut self, f: F) -> Result<(), postcard::Error>
    where
        F: FnOnce(&mut T),
    {
        f(&mut self.value);
        self.encode()
    }

    /// Size of the current encoding
    pub fn encoded_len(&self) -> usize {
        self.len
    }

    fn encode(&mut self) -> Result<(), postcard::Error> {
        let mut scratch = [0u8; N];
        let len = postcard::to_slice(&self.value, &mut scratch)?.len();
        self.encoded[..len].copy_from_slice(&scratch[..len]);
        self.len = len;
        Ok(())
    }
}

impl<T, const N: usize> Persister for PostcardBlob<T, N>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self) -> &[u8] {
        &self.encoded[..self.len]
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        if data.len() > N {
            return Err(DecodeError::Rejected);
        }
        let value: T = postcard::from_bytes(data)?;
        self.value = value;
        self.encoded[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Calibration {
        offset: i16,
        gain: u16,
    }

    #[test]
    fn test_encoding_follows_value() {
        let mut blob: PostcardBlob<Calibration, 16> =
            PostcardBlob::new(Calibration { offset: 0, gain: 1 }).unwrap();
        let first = blob.serialize().to_vec();

        blob.modify(|c| c.gain = 1000).unwrap();
        assert_ne!(blob.serialize(), first.as_slice());

        let mut other: PostcardBlob<Calibration, 16> =
            PostcardBlob::new(Calibration { offset: 0, gain: 0 }).unwrap();
        other.deserialize(blob.serialize()).unwrap();
        assert_eq!(other.get(), blob.get());
        assert_eq!(other.serialize(), blob.serialize());
    }

    #[test]
    fn test_set_too_large_keeps_value() {
        let mut blob: PostcardBlob<[u32; 4], 8> = PostcardBlob::new([0; 4]).unwrap();
        assert!(blob.set([u32::MAX; 4]).is_err());
        assert_eq!(blob.get(), &[0; 4]);
        assert_eq!(blob.encoded_len(), 4);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let mut blob: PostcardBlob<u32, 8> = PostcardBlob::new(7).unwrap();
        assert_eq!(blob.deserialize(&[]), Err(DecodeError::Truncated));
        assert_eq!(*blob.get(), 7);
    }
}
