//! Value conversion between the bridge's JSON values and QuickJS values.

use rquickjs::{Array, Ctx, Object, Type, Value as JsValue};
use serde_json::{Map, Number, Value};

use crate::error::{QuickJsError, QuickJsResult};

/// Nesting limit for structured values; also stops cyclic objects.
const MAX_DEPTH: usize = 64;

/// Largest integer a double represents exactly.
pub(crate) const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Convert a JavaScript value to a bridge value.
///
/// `undefined`, functions, symbols and other non-data values become `null`.
/// Integral floats within the safe range come back as integers.
pub fn js_to_json(value: &JsValue<'_>) -> QuickJsResult<Value> {
    to_json(value, 0)
}

fn to_json(value: &JsValue<'_>, depth: usize) -> QuickJsResult<Value> {
    if depth > MAX_DEPTH {
        return Err(QuickJsError::Conversion(format!(
            "value nested deeper than {} levels",
            MAX_DEPTH
        )));
    }

    match value.type_of() {
        Type::Bool => Ok(Value::Bool(value.as_bool().unwrap_or_default())),
        Type::Int => Ok(Value::from(value.as_int().unwrap_or_default())),
        Type::Float => Ok(float_to_json(value.as_float().unwrap_or_default())),
        Type::String => {
            let s: String = value
                .get()
                .map_err(|e| QuickJsError::Conversion(e.to_string()))?;
            Ok(Value::String(s))
        }
        Type::Array => {
            let Some(arr) = value.as_array() else {
                return Ok(Value::Null);
            };
            let mut values = Vec::with_capacity(arr.len());
            for i in 0..arr.len() {
                let item: JsValue = arr
                    .get(i)
                    .map_err(|e| QuickJsError::Conversion(e.to_string()))?;
                values.push(to_json(&item, depth + 1)?);
            }
            Ok(Value::Array(values))
        }
        Type::Object => {
            let Some(obj) = value.as_object() else {
                return Ok(Value::Null);
            };
            let mut fields = Map::new();
            for prop in obj.props::<String, JsValue>() {
                let (key, val) = prop.map_err(|e| QuickJsError::Conversion(e.to_string()))?;
                fields.insert(key, to_json(&val, depth + 1)?);
            }
            Ok(Value::Object(fields))
        }
        _ => Ok(Value::Null),
    }
}

fn float_to_json(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER {
        return Value::from(f as i64);
    }
    // NaN and infinities have no JSON form
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

/// Convert a bridge value into a JavaScript value.
///
/// Integers outside the `i32` range are passed as doubles.
pub fn json_to_js<'js>(ctx: &Ctx<'js>, json: &Value) -> QuickJsResult<JsValue<'js>> {
    match json {
        Value::Null => Ok(JsValue::new_null(ctx.clone())),
        Value::Bool(b) => Ok(JsValue::new_bool(ctx.clone(), *b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Ok(JsValue::new_int(ctx.clone(), i))
            } else {
                Ok(JsValue::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        Value::String(s) => {
            let js = rquickjs::String::from_str(ctx.clone(), s)?;
            Ok(js.into_value())
        }
        Value::Array(items) => {
            let js_arr = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                js_arr.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(js_arr.into_value())
        }
        Value::Object(fields) => {
            let js_obj = Object::new(ctx.clone())?;
            for (key, val) in fields {
                js_obj.set(key.as_str(), json_to_js(ctx, val)?)?;
            }
            Ok(js_obj.into_value())
        }
    }
}
