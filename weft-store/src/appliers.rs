//! Per-tag semantics of `add` and `subtract`.
//!
//! Mutations apply in place; any mixed-tag combination is a type clash.

use weft_model::Value;

use crate::error::StoreError;

/// Applies `target += operand`.
///
/// Numeric tags add, strings concatenate, sets union, tables merge with the
/// operand winning per key, lists append the operand as one element.
pub fn add_to(target: &mut Value, operand: &Value) -> Result<(), StoreError> {
    match (target, operand) {
        (Value::Count(t), Value::Count(o)) => *t = t.wrapping_add(*o),
        (Value::Integer(t), Value::Integer(o)) => *t = t.wrapping_add(*o),
        (Value::Real(t), Value::Real(o)) => *t += *o,
        (Value::String(t), Value::String(o)) => t.push_str(o),
        (Value::Set(t), Value::Set(o)) => t.extend(o.iter().cloned()),
        (Value::Table(t), Value::Table(o)) => {
            for (key, value) in o {
                t.insert(key.clone(), value.clone());
            }
        }
        (Value::List(t), o) => t.push(o.clone()),
        _ => return Err(StoreError::TypeClash),
    }
    Ok(())
}

/// Applies `target -= operand`, the inverse of [`add_to`].
///
/// String removal is undefined and rejected. Lists pop their last element
/// regardless of the operand.
pub fn subtract_from(target: &mut Value, operand: &Value) -> Result<(), StoreError> {
    match (target, operand) {
        (Value::Count(t), Value::Count(o)) => *t = t.wrapping_sub(*o),
        (Value::Integer(t), Value::Integer(o)) => *t = t.wrapping_sub(*o),
        (Value::Real(t), Value::Real(o)) => *t -= *o,
        (Value::Set(t), Value::Set(o)) => {
            for element in o {
                t.remove(element);
            }
        }
        (Value::Table(t), Value::Table(o)) => {
            for key in o.keys() {
                t.remove(key);
            }
        }
        (Value::List(t), _) => {
            t.pop();
        }
        _ => return Err(StoreError::TypeClash),
    }
    Ok(())
}
