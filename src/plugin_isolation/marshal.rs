//! 戻り値のマーシャリング
//!
//! 境界内の値をプレーンな JSON に変換する。表現できない値は黙って変換せず拒否する。

use rquickjs::{Ctx, Function, Object, Type, Value};
use serde_json::{Map, Number, Value as JsonValue};

/// 2^53 - 1
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// オブジェクトがプレーンな JSON オブジェクトとして読めるかを調べる
///
/// 問題がなければ空文字列、あれば理由を返す。ゲッターは呼び出さない。
const INSPECTOR: &str = r#"
(function () {
  'use strict';
  const objectPrototype = Object.prototype;
  const getPrototypeOf = Object.getPrototypeOf;
  const getOwnPropertyDescriptor = Object.getOwnPropertyDescriptor;
  const ownKeys = Reflect.ownKeys;
  const hasOwn = Function.prototype.call.bind(Object.prototype.hasOwnProperty);

  return function inspect(value) {
    const prototype = getPrototypeOf(value);
    if (prototype !== objectPrototype && prototype !== null) {
      return 'a non-plain object';
    }
    const keys = ownKeys(value);
    for (let i = 0; i < keys.length; i++) {
      const key = keys[i];
      if (typeof key === 'symbol') {
        return 'a symbol-keyed property';
      }
      const descriptor = getOwnPropertyDescriptor(value, key);
      if (descriptor.enumerable && !hasOwn(descriptor, 'value')) {
        return 'an accessor property "' + key + '"';
      }
    }
    return '';
  };
})()
"#;

#[derive(Debug)]
pub enum MarshalError {
    /// JSON で表現できない値
    Unserializable(String),
    /// 値の読み取り中にエンジンが失敗した（プロキシのトラップの例外など）
    Engine(rquickjs::Error),
}

impl From<rquickjs::Error> for MarshalError {
    fn from(err: rquickjs::Error) -> Self {
        MarshalError::Engine(err)
    }
}

/// 境界内の値を JSON に変換する
///
/// 受け付けるのは `null`・真偽値・有限の数値・文字列と、それらからなる配列と
/// プレーンなオブジェクトだけ。トップレベルの `undefined`（値を持たない文の完了値）は `null` とする。
pub struct Marshaller<'js> {
    inspect: Function<'js>,
    max_depth: usize,
}

impl<'js> Marshaller<'js> {
    /// 検査関数を生成する
    ///
    /// 組み込みの参照を閉じ込めるため、プラグインコードを評価する前に呼ぶこと。
    pub fn inspector(ctx: &Ctx<'js>) -> rquickjs::Result<Function<'js>> {
        ctx.eval(INSPECTOR)
    }

    pub fn new(inspect: Function<'js>, max_depth: usize) -> Self {
        Self { inspect, max_depth }
    }

    pub fn to_json(&self, value: &Value<'js>) -> Result<JsonValue, MarshalError> {
        self.convert(value, 0)
    }

    fn convert(&self, value: &Value<'js>, depth: usize) -> Result<JsonValue, MarshalError> {
        if depth > self.max_depth {
            return Err(MarshalError::Unserializable(format!(
                "result nesting exceeds {} levels",
                self.max_depth
            )));
        }

        match value.type_of() {
            Type::Undefined if depth == 0 => Ok(JsonValue::Null),
            Type::Null => Ok(JsonValue::Null),
            Type::Bool => Ok(JsonValue::Bool(value.as_bool().unwrap_or_default())),
            Type::Int => Ok(JsonValue::from(value.as_int().unwrap_or_default())),
            Type::Float => float_to_json(value.as_float().unwrap_or(f64::NAN)),
            Type::String => match value.as_string() {
                Some(string) => Ok(JsonValue::String(string.to_string()?)),
                None => Err(unserializable("string")),
            },
            Type::Array => {
                let array = value.as_array().ok_or_else(|| unserializable("array"))?;
                let mut items = Vec::with_capacity(array.len());
                for item in array.iter::<Value>() {
                    items.push(self.convert(&item?, depth + 1)?);
                }
                Ok(JsonValue::Array(items))
            }
            Type::Object => {
                let object = value.as_object().ok_or_else(|| unserializable("object"))?;
                self.ensure_plain(object)?;
                let mut map = Map::new();
                for entry in object.props::<String, Value>() {
                    let (key, item) = entry?;
                    map.insert(key, self.convert(&item, depth + 1)?);
                }
                Ok(JsonValue::Object(map))
            }
            other => Err(MarshalError::Unserializable(format!(
                "value of type {:?} cannot be represented as JSON",
                other
            ))),
        }
    }

    fn ensure_plain(&self, object: &Object<'js>) -> Result<(), MarshalError> {
        let problem: String = self.inspect.call((object.clone(),))?;
        if problem.is_empty() {
            Ok(())
        } else {
            Err(MarshalError::Unserializable(format!(
                "result contains {} and cannot be represented as JSON",
                problem
            )))
        }
    }
}

fn float_to_json(number: f64) -> Result<JsonValue, MarshalError> {
    if !number.is_finite() {
        return Err(MarshalError::Unserializable(format!(
            "non-finite number {} cannot be represented as JSON",
            number
        )));
    }
    if number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER {
        return Ok(JsonValue::from(number as i64));
    }
    Number::from_f64(number)
        .map(JsonValue::Number)
        .ok_or_else(|| unserializable("number"))
}

fn unserializable(what: &str) -> MarshalError {
    MarshalError::Unserializable(format!("{} could not be read", what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    fn eval_json(source: &str) -> Result<JsonValue, String> {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let inspect = Marshaller::inspector(&ctx).unwrap();
            let value: Value = ctx.eval(source).unwrap();
            Marshaller::new(inspect, 8)
                .to_json(&value)
                .map_err(|e| match e {
                    MarshalError::Unserializable(message) => message,
                    MarshalError::Engine(err) => err.to_string(),
                })
        })
    }

    #[test]
    fn test_plain_values() {
        assert_eq!(eval_json("1+1").unwrap(), json!(2));
        assert_eq!(eval_json("0.5 + 1.5").unwrap(), json!(2));
        assert_eq!(eval_json("0.25").unwrap(), json!(0.25));
        assert_eq!(eval_json("'hi'").unwrap(), json!("hi"));
        assert_eq!(eval_json("null").unwrap(), json!(null));
        assert_eq!(eval_json("undefined").unwrap(), json!(null));
        assert_eq!(
            eval_json("({a: [1, true, 'x'], b: {c: null}})").unwrap(),
            json!({"a": [1, true, "x"], "b": {"c": null}})
        );
    }

    #[test]
    fn test_rejects_unrepresentable_values() {
        for source in [
            "(function () {})",
            "Symbol('s')",
            "NaN",
            "1 / 0",
            "({a: undefined})",
            "[1, undefined]",
            "10n",
        ] {
            assert!(eval_json(source).is_err(), "{} should be rejected", source);
        }
    }

    #[test]
    fn test_rejects_cycles_and_deep_nesting() {
        assert!(eval_json("const a = {}; a.self = a; a").is_err());
        assert!(eval_json("[[[[[[[[[[1]]]]]]]]]]").is_err());
        assert!(eval_json("[[[[1]]]]").is_ok());
    }

    #[test]
    fn test_rejects_non_plain_objects() {
        for source in [
            "new Date(0)",
            "new Map([[1, 2]])",
            "new Set([1])",
            "/abc/",
            "new Uint8Array([1, 2])",
            "new (class Point { constructor() { this.x = 1; } })()",
            "({ when: new Date(0) })",
            "[1, new Map()]",
        ] {
            let err = eval_json(source).unwrap_err();
            assert!(err.contains("non-plain object"), "{} -> {}", source, err);
        }
    }

    #[test]
    fn test_rejects_accessors_and_symbol_keys() {
        let err = eval_json("({ get secret() { return 1; } })").unwrap_err();
        assert!(err.contains("accessor property"), "{}", err);

        let err = eval_json("({ [Symbol('k')]: 1 })").unwrap_err();
        assert!(err.contains("symbol-keyed"), "{}", err);
    }

    #[test]
    fn test_getters_are_not_invoked() {
        // ゲッターが呼ばれると例外になり、メッセージが変わる
        let err =
            eval_json("({ get boom() { throw new Error('getter ran'); } })").unwrap_err();
        assert!(err.contains("accessor property"), "{}", err);
    }

    #[test]
    fn test_null_prototype_objects_accepted() {
        assert_eq!(
            eval_json("Object.assign(Object.create(null), { a: 1 })").unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn test_tampered_builtins_do_not_bypass_inspection() {
        let err = eval_json(
            "Object.getPrototypeOf = () => Object.prototype; \
             Reflect.ownKeys = () => []; \
             new Date(0)",
        )
        .unwrap_err();
        assert!(err.contains("non-plain object"), "{}", err);
    }
}
