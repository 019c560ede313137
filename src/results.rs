use std::collections::HashMap;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};

/// Positional results: index `i` holds the value of task `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Results<R>(Vec<R>);

impl<R> Results<R> {
  /// Removes and returns the first value.
  pub fn shift(&mut self) -> Option<R> {
    if self.0.is_empty() {
      None
    } else {
      Some(self.0.remove(0))
    }
  }

  pub fn into_vec(self) -> Vec<R> {
    self.0
  }
}

impl<R> Deref for Results<R> {
  type Target = Vec<R>;

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl<R> DerefMut for Results<R> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.0
  }
}

impl<R> From<Vec<R>> for Results<R> {
  fn from(values: Vec<R>) -> Self {
    Self(values)
  }
}

impl<R> From<Results<R>> for Vec<R> {
  fn from(results: Results<R>) -> Self {
    results.0
  }
}

impl<R> FromIterator<R> for Results<R> {
  fn from_iter<I: IntoIterator<Item = R>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl<R> IntoIterator for Results<R> {
  type Item = R;
  type IntoIter = std::vec::IntoIter<R>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.into_iter()
  }
}

impl<R: PartialEq> PartialEq<Vec<R>> for Results<R> {
  fn eq(&self, other: &Vec<R>) -> bool {
    &self.0 == other
  }
}

/// Pairs `keys[i]` with `values[i]`; `None` when the lengths differ.
pub fn map<K, V>(keys: impl IntoIterator<Item = K>, values: impl IntoIterator<Item = V>) -> Option<HashMap<K, V>>
where
  K: Eq + Hash,
{
  let keys: Vec<K> = keys.into_iter().collect();
  let values: Vec<V> = values.into_iter().collect();
  if keys.len() != values.len() {
    return None;
  }
  Some(keys.into_iter().zip(values).collect())
}

/// Concatenates a sequence of sequences.
pub fn flatten<T>(lists: impl IntoIterator<Item = impl IntoIterator<Item = T>>) -> Vec<T> {
  lists.into_iter().flatten().collect()
}
