//! Cache session contract and value coercion.

use crate::Result;
use std::time::Duration;

/// Operations the cache client needs from a live connection.
///
/// Values are plain strings; lists back the FIFO queue operations.
pub trait CacheSession: Send {
    /// `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unusable.
    fn ping(&mut self) -> Result<()>;

    /// `GET`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    fn get(&mut self, key: &str) -> Result<Option<String>>;

    /// `SET`, with an optional expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// `DEL`; returns how many keys existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    fn delete(&mut self, keys: &[String]) -> Result<u64>;

    /// Every key starting with `prefix` (the prefix is matched literally).
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    fn scan_prefix(&mut self, prefix: &str) -> Result<Vec<String>>;

    /// `EXISTS`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    fn exists(&mut self, key: &str) -> Result<bool>;

    /// `LPUSH`; returns the new list length.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    fn push_front(&mut self, key: &str, value: &str) -> Result<u64>;

    /// `RPOP`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    fn pop_back(&mut self, key: &str) -> Result<Option<String>>;
}

/// Values the cache stores as text.
///
/// `None` is stored as the empty string.
pub trait CacheText {
    /// Renders the value as stored text.
    fn to_cache_text(&self) -> String;
}

macro_rules! cache_text_via_display {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl CacheText for $ty {
                fn to_cache_text(&self) -> String {
                    self.to_string()
                }
            }
        )+
    };
}

cache_text_via_display!(
    str, String, bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32,
    f64,
);

impl<T: CacheText + ?Sized> CacheText for &T {
    fn to_cache_text(&self) -> String {
        (**self).to_cache_text()
    }
}

impl<T: CacheText> CacheText for Option<T> {
    fn to_cache_text(&self) -> String {
        self.as_ref().map(CacheText::to_cache_text).unwrap_or_default()
    }
}

impl CacheText for serde_json::Value {
    fn to_cache_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numbers_and_text() {
        assert_eq!(42_i32.to_cache_text(), "42");
        assert_eq!(1.5_f64.to_cache_text(), "1.5");
        assert_eq!("plain".to_cache_text(), "plain");
        assert_eq!(String::from("owned").to_cache_text(), "owned");
        assert_eq!(true.to_cache_text(), "true");
    }

    #[test]
    fn test_absent_value_is_empty_text() {
        assert_eq!(Option::<i32>::None.to_cache_text(), "");
        assert_eq!(Some("x").to_cache_text(), "x");
        assert_eq!(json!(null).to_cache_text(), "");
    }

    #[test]
    fn test_json_values() {
        assert_eq!(json!("s").to_cache_text(), "s");
        assert_eq!(json!({"a": 1}).to_cache_text(), r#"{"a":1}"#);
    }
}
