//! Edits on paginated list payloads that keep the accompanying total in step.
//!
//! The total is best-effort: it is adjusted with each edit but never
//! reconciled against the server until the list is refetched.

use serde_json::Value;

/// Where the items, total and item ids live in a list payload.
///
/// Paths are JSON pointers; the empty pointer means the payload itself is the
/// item array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListShape {
  pub items: String,
  pub total: Option<String>,
  pub id_field: String,
}

impl Default for ListShape {
  /// `{ "items": [...], "total": n }`
  fn default() -> Self {
    Self {
      items: "/items".to_string(),
      total: Some("/total".to_string()),
      id_field: "id".to_string(),
    }
  }
}

impl ListShape {
  /// A bare JSON array with no total.
  pub fn bare() -> Self {
    Self {
      items: String::new(),
      total: None,
      id_field: "id".to_string(),
    }
  }

  pub fn new(items: &str, total: Option<&str>, id_field: &str) -> Self {
    Self {
      items: items.to_string(),
      total: total.map(String::from),
      id_field: id_field.to_string(),
    }
  }

  fn items_mut<'a>(&self, list: &'a mut Value) -> Option<&'a mut Vec<Value>> {
    list.pointer_mut(&self.items)?.as_array_mut()
  }

  fn adjust_total(&self, list: &mut Value, delta: i64) {
    let Some(total) = self.total.as_ref().and_then(|p| list.pointer_mut(p)) else {
      return;
    };
    if let Some(current) = total.as_i64() {
      *total = Value::from((current + delta).max(0));
    }
  }

  fn position_of(&self, items: &[Value], id: &str) -> Option<usize> {
    items.iter().position(|item| match item.get(&self.id_field) {
      Some(Value::String(s)) => s == id,
      Some(Value::Number(n)) => n.to_string() == id,
      _ => false,
    })
  }

  /// Insert `item` at `position` (clamped to the end). Returns false if the
  /// payload does not have the expected shape.
  pub fn insert_at(&self, list: &mut Value, position: usize, item: Value) -> bool {
    let Some(items) = self.items_mut(list) else {
      return false;
    };
    let position = position.min(items.len());
    items.insert(position, item);
    self.adjust_total(list, 1);
    true
  }

  /// Apply `f` to the item with `id`. Returns false if it is not in the list.
  pub fn patch_by_id(&self, list: &mut Value, id: &str, f: impl FnOnce(&mut Value)) -> bool {
    let Some(items) = self.items_mut(list) else {
      return false;
    };
    match self.position_of(items, id) {
      Some(index) => {
        f(&mut items[index]);
        true
      }
      None => false,
    }
  }

  /// Remove the item with `id`, returning it.
  pub fn remove_by_id(&self, list: &mut Value, id: &str) -> Option<Value> {
    let items = self.items_mut(list)?;
    let index = self.position_of(items, id)?;
    let removed = items.remove(index);
    self.adjust_total(list, -1);
    Some(removed)
  }
}
