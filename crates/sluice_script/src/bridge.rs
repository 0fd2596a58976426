//! Value bridge
//!
//! Converts between [`DynamicValue`] and QuickJS values.
//!
//! | DynamicValue              | JavaScript                         |
//! |---------------------------|------------------------------------|
//! | Undefined                 | `null` at top level, absent inside containers |
//! | Boolean / Integer / Real  | boolean / number                   |
//! | String, Uuid, Timestamp, Uri | string                          |
//! | Binary                    | `Uint8Array`                       |
//! | Array                     | array, trailing Undefined trimmed, middle ones left as holes |
//! | Map                       | plain object, Undefined entries omitted |
//!
//! Coming back, `undefined` and `null` both become Undefined and an integral
//! float that fits `i32` becomes Integer. Arrays are read up to their last
//! defined element, whatever `length` claims, so trailing Undefined never
//! comes out. An array or object left empty becomes Undefined. Only plain
//! objects (prototype `Object.prototype` or `null`) are read as maps; class
//! instances such as `Date`, `Map` or `RegExp` are rejected.
//!
//! Every container descent goes through a [`StackBudget`] and every
//! container is capped at `max_elements`, so deep, cyclic or huge values
//! fail cleanly.

use crate::error::ConversionError;
use rquickjs::{Array, Ctx, FromJs, Function, IntoJs, Object, Type, TypedArray, Value};
use sluice_core::value::{format_timestamp, ValueMap};
use sluice_core::DynamicValue;

/// Depth tracker for one conversion.
#[derive(Debug)]
pub struct StackBudget {
    depth: usize,
    limit: usize,
}

impl StackBudget {
    pub fn new(limit: usize) -> Self {
        Self { depth: 0, limit }
    }

    /// Claim room for one more nesting level.
    pub fn enter(&mut self) -> Result<(), ConversionError> {
        if self.depth >= self.limit {
            return Err(ConversionError::StackExhausted { limit: self.limit });
        }
        self.depth += 1;
        Ok(())
    }

    pub fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Default cap on the elements of one converted container.
pub const DEFAULT_MAX_ELEMENTS: usize = 1 << 20;

#[derive(Debug, Clone, Copy)]
pub struct ValueBridge {
    max_depth: usize,
    max_elements: usize,
}

impl ValueBridge {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            max_elements: DEFAULT_MAX_ELEMENTS,
        }
    }

    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = max_elements;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Push `value` into the interpreter.
    pub fn to_js<'js>(
        &self,
        ctx: &Ctx<'js>,
        value: &DynamicValue,
    ) -> Result<Value<'js>, ConversionError> {
        let mut budget = StackBudget::new(self.max_depth);
        self.push(ctx, value, &mut budget)
    }

    /// Pull an interpreter value out as a [`DynamicValue`].
    pub fn from_js<'js>(
        &self,
        ctx: &Ctx<'js>,
        value: &Value<'js>,
    ) -> Result<DynamicValue, ConversionError> {
        let mut budget = StackBudget::new(self.max_depth);
        self.pull(ctx, value, &mut budget)
    }

    /// The `[pump, data]` pair handed to a resumed `get_event_next()`.
    pub fn event_to_js<'js>(
        &self,
        ctx: &Ctx<'js>,
        pump: &str,
        data: &DynamicValue,
    ) -> Result<Value<'js>, ConversionError> {
        let event = Array::new(ctx.clone())?;
        event.set(0, pump)?;
        event.set(1, self.to_js(ctx, data)?)?;
        Ok(event.into_value())
    }

    fn push<'js>(
        &self,
        ctx: &Ctx<'js>,
        value: &DynamicValue,
        budget: &mut StackBudget,
    ) -> Result<Value<'js>, ConversionError> {
        let js = match value {
            DynamicValue::Undefined => Value::new_null(ctx.clone()),
            DynamicValue::Boolean(b) => Value::new_bool(ctx.clone(), *b),
            DynamicValue::Integer(i) => Value::new_int(ctx.clone(), *i),
            DynamicValue::Real(r) => Value::new_float(ctx.clone(), *r),
            DynamicValue::String(s) | DynamicValue::Uri(s) => s.as_str().into_js(ctx)?,
            DynamicValue::Uuid(id) => id.to_string().into_js(ctx)?,
            DynamicValue::Timestamp(at) => format_timestamp(at).into_js(ctx)?,
            DynamicValue::Binary(bytes) => {
                TypedArray::<u8>::new(ctx.clone(), bytes.clone())?.into_js(ctx)?
            }
            DynamicValue::Array(items) => {
                budget.enter()?;
                let array = Array::new(ctx.clone())?;
                let used = items
                    .iter()
                    .rposition(DynamicValue::is_defined)
                    .map_or(0, |last| last + 1);
                for (index, item) in items[..used].iter().enumerate() {
                    if item.is_defined() {
                        array.set(index, self.push(ctx, item, budget)?)?;
                    }
                }
                budget.exit();
                array.into_value()
            }
            DynamicValue::Map(entries) => {
                budget.enter()?;
                let object = Object::new(ctx.clone())?;
                for (key, item) in entries.iter().filter(|(_, item)| item.is_defined()) {
                    object.set(key.as_str(), self.push(ctx, item, budget)?)?;
                }
                budget.exit();
                object.into_value()
            }
        };
        Ok(js)
    }

    fn pull<'js>(
        &self,
        ctx: &Ctx<'js>,
        value: &Value<'js>,
        budget: &mut StackBudget,
    ) -> Result<DynamicValue, ConversionError> {
        let converted = match value.type_of() {
            Type::Undefined | Type::Null => DynamicValue::Undefined,
            Type::Bool => DynamicValue::Boolean(bool::from_js(ctx, value.clone())?),
            Type::Int => DynamicValue::Integer(i32::from_js(ctx, value.clone())?),
            Type::Float => real_or_integer(f64::from_js(ctx, value.clone())?),
            Type::String => DynamicValue::String(String::from_js(ctx, value.clone())?),
            Type::Array => {
                let array = Array::from_js(ctx, value.clone())?;
                let used = self.used_length(&array)?;
                if used == 0 {
                    return Ok(DynamicValue::Undefined);
                }
                budget.enter()?;
                let mut items = Vec::with_capacity(used);
                for index in 0..used {
                    let item: Value<'js> = array.get(index)?;
                    items.push(self.pull(ctx, &item, budget)?);
                }
                budget.exit();
                trim_trailing(items)
            }
            Type::Object => {
                if let Ok(typed) = TypedArray::<u8>::from_js(ctx, value.clone()) {
                    if let Some(bytes) = typed.as_bytes() {
                        return Ok(DynamicValue::Binary(bytes.to_vec()));
                    }
                }
                let object = Object::from_js(ctx, value.clone())?;
                if !is_plain_object(ctx, &object)? {
                    return Err(ConversionError::Unsupported {
                        kind: class_name(&object),
                    });
                }
                budget.enter()?;
                let mut entries = ValueMap::new();
                for (seen, prop) in object.props::<String, Value<'js>>().enumerate() {
                    if seen >= self.max_elements {
                        return Err(ConversionError::TooManyElements {
                            limit: self.max_elements,
                        });
                    }
                    let (key, item) = prop?;
                    let item = self.pull(ctx, &item, budget)?;
                    if item.is_defined() {
                        entries.insert(key, item);
                    }
                }
                budget.exit();
                if entries.is_empty() {
                    DynamicValue::Undefined
                } else {
                    DynamicValue::Map(entries)
                }
            }
            other => {
                return Err(ConversionError::Unsupported {
                    kind: format!("{other:?}").to_lowercase(),
                })
            }
        };
        Ok(converted)
    }

    /// One past the highest index that actually holds an element.
    ///
    /// Walks the array's own keys rather than trusting `length`, which a
    /// script can set to anything.
    fn used_length(&self, array: &Array<'_>) -> Result<usize, ConversionError> {
        let mut used = 0;
        for (seen, key) in array.keys::<String>().enumerate() {
            if seen >= self.max_elements {
                return Err(ConversionError::TooManyElements {
                    limit: self.max_elements,
                });
            }
            if let Ok(index) = key?.parse::<usize>() {
                used = used.max(index + 1);
            }
        }
        if used > self.max_elements {
            return Err(ConversionError::TooManyElements {
                limit: self.max_elements,
            });
        }
        Ok(used)
    }
}

impl Default for ValueBridge {
    fn default() -> Self {
        Self::new(256)
    }
}

fn trim_trailing(mut items: Vec<DynamicValue>) -> DynamicValue {
    let used = items
        .iter()
        .rposition(DynamicValue::is_defined)
        .map_or(0, |last| last + 1);
    items.truncate(used);
    if items.is_empty() {
        DynamicValue::Undefined
    } else {
        DynamicValue::Array(items)
    }
}

/// Prototype is `Object.prototype` or `null`.
fn is_plain_object<'js>(ctx: &Ctx<'js>, object: &Object<'js>) -> rquickjs::Result<bool> {
    let constructor: Object<'js> = ctx.globals().get("Object")?;
    let prototype_of: Function<'js> = constructor.get("getPrototypeOf")?;
    let prototype: Value<'js> = prototype_of.call((object.clone(),))?;
    if prototype.is_null() {
        return Ok(true);
    }
    let plain: Value<'js> = constructor.get("prototype")?;
    Ok(prototype == plain)
}

fn class_name(object: &Object<'_>) -> String {
    object
        .get::<_, Object>("constructor")
        .and_then(|constructor| constructor.get::<_, String>("name"))
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "object".to_string())
}

fn real_or_integer(real: f64) -> DynamicValue {
    if real.fract() == 0.0 && real >= f64::from(i32::MIN) && real <= f64::from(i32::MAX) {
        DynamicValue::Integer(real as i32)
    } else {
        DynamicValue::Real(real)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn with_ctx<F>(f: F)
    where
        F: for<'js> FnOnce(Ctx<'js>) + Send,
    {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(f);
    }

    fn round_trip(bridge: &ValueBridge, value: &DynamicValue) -> DynamicValue {
        let mut result = DynamicValue::Undefined;
        let out = &mut result;
        with_ctx(|ctx| {
            let js = bridge.to_js(&ctx, value).unwrap();
            *out = bridge.from_js(&ctx, &js).unwrap();
        });
        result
    }

    #[test]
    fn budget_counts_levels() {
        let mut budget = StackBudget::new(2);
        budget.enter().unwrap();
        budget.enter().unwrap();
        assert!(matches!(
            budget.enter(),
            Err(ConversionError::StackExhausted { limit: 2 })
        ));
        budget.exit();
        assert_eq!(budget.depth(), 1);
        budget.enter().unwrap();
    }

    #[test]
    fn integral_reals_collapse() {
        assert_eq!(real_or_integer(27.0), DynamicValue::Integer(27));
        assert_eq!(real_or_integer(3.5), DynamicValue::Real(3.5));
        assert_eq!(real_or_integer(1e12), DynamicValue::Real(1e12));
    }

    #[test]
    fn scalars_survive() {
        let bridge = ValueBridge::default();
        for value in [
            DynamicValue::from(true),
            DynamicValue::from(17),
            DynamicValue::from(3.14),
            DynamicValue::from("string"),
            DynamicValue::from(vec![3u8, 1, 4]),
        ] {
            assert_eq!(round_trip(&bridge, &value), value);
        }
        assert_eq!(
            round_trip(&bridge, &DynamicValue::uri("https://example.com/x")),
            DynamicValue::from("https://example.com/x")
        );
    }

    #[test]
    fn empty_containers_vanish() {
        let bridge = ValueBridge::default();
        assert!(round_trip(&bridge, &DynamicValue::empty_array()).is_undefined());
        assert!(round_trip(&bridge, &DynamicValue::empty_map()).is_undefined());
    }

    #[test]
    fn arrays_trim_trailing_and_keep_holes() {
        let bridge = ValueBridge::default();
        let value = DynamicValue::array([
            DynamicValue::from(1),
            DynamicValue::Undefined,
            DynamicValue::from(3),
            DynamicValue::Undefined,
        ]);
        assert_eq!(
            round_trip(&bridge, &value),
            DynamicValue::array([
                DynamicValue::from(1),
                DynamicValue::Undefined,
                DynamicValue::from(3)
            ])
        );
    }

    #[test]
    fn maps_drop_undefined_entries() {
        let bridge = ValueBridge::default();
        let value = DynamicValue::map([
            ("kept", DynamicValue::from("yes")),
            ("gone", DynamicValue::Undefined),
        ]);
        assert_eq!(
            round_trip(&bridge, &value),
            DynamicValue::map([("kept", DynamicValue::from("yes"))])
        );
    }

    #[test]
    fn top_level_undefined_is_null() {
        let bridge = ValueBridge::default();
        with_ctx(|ctx| {
            let js = bridge.to_js(&ctx, &DynamicValue::Undefined).unwrap();
            assert!(js.is_null());
        });
    }

    #[test]
    fn deep_nesting_converts_until_the_limit() {
        let mut value = DynamicValue::from("leaf");
        for level in 0..20 {
            value = DynamicValue::map([(format!("level{level}"), value)]);
        }
        assert_eq!(round_trip(&ValueBridge::default(), &value), value);

        let shallow = ValueBridge::new(8);
        with_ctx(|ctx| {
            assert!(matches!(
                shallow.to_js(&ctx, &value),
                Err(ConversionError::StackExhausted { limit: 8 })
            ));
        });
    }

    #[test]
    fn cycles_hit_the_depth_limit() {
        let bridge = ValueBridge::new(32);
        with_ctx(|ctx| {
            let cyclic: Value = ctx.eval("const a = { n: 1 }; a.self = a; a").unwrap();
            assert!(matches!(
                bridge.from_js(&ctx, &cyclic),
                Err(ConversionError::StackExhausted { .. })
            ));
        });
    }

    #[test]
    fn opaque_values_are_rejected() {
        let bridge = ValueBridge::default();
        with_ctx(|ctx| {
            for source in [
                "(() => 1)",
                "Symbol('s')",
                "new Date(0)",
                "new Map([[1, 2]])",
                "new Set([1])",
                "/re/g",
                "new ArrayBuffer(4)",
                "new Int16Array(2)",
                "new (class Point { constructor() { this.x = 1; } })()",
                "({ inner: new Date(0) })",
            ] {
                let value: Value = ctx.eval(source).unwrap();
                assert!(
                    matches!(
                        bridge.from_js(&ctx, &value),
                        Err(ConversionError::Unsupported { .. })
                    ),
                    "{source} was not rejected"
                );
            }
        });
    }

    #[test]
    fn null_prototype_objects_are_maps() {
        let bridge = ValueBridge::default();
        with_ctx(|ctx| {
            let value: Value = ctx
                .eval("const bare = Object.create(null); bare.k = 'v'; bare")
                .unwrap();
            assert_eq!(
                bridge.from_js(&ctx, &value).unwrap(),
                DynamicValue::map([("k", DynamicValue::from("v"))])
            );
        });
    }

    #[test]
    fn script_arrays_drop_trailing_nulls() {
        let bridge = ValueBridge::default();
        with_ctx(|ctx| {
            let pull = |source: &str| {
                let value: Value = ctx.eval(source).unwrap();
                bridge.from_js(&ctx, &value).unwrap()
            };
            assert_eq!(pull("[1, null]"), DynamicValue::array([1]));
            assert_eq!(pull("[1, undefined, null]"), DynamicValue::array([1]));
            assert!(pull("[null]").is_undefined());
            assert!(pull("[undefined, null]").is_undefined());
            assert_eq!(
                pull("[null, 2]"),
                DynamicValue::array([DynamicValue::Undefined, DynamicValue::from(2)])
            );
        });
    }

    #[test]
    fn sparse_arrays_ignore_length() {
        let bridge = ValueBridge::default();
        with_ctx(|ctx| {
            let huge: Value = ctx
                .eval("const huge = [1]; huge.length = 2 ** 32 - 1; huge")
                .unwrap();
            assert_eq!(bridge.from_js(&ctx, &huge).unwrap(), DynamicValue::array([1]));

            let hollow: Value = ctx
                .eval("const hollow = []; hollow.length = 2 ** 32 - 1; hollow")
                .unwrap();
            assert!(bridge.from_js(&ctx, &hollow).unwrap().is_undefined());

            let gap: Value = ctx
                .eval("const gap = []; gap[2] = 'x'; gap.length = 1e9; gap")
                .unwrap();
            assert_eq!(
                bridge.from_js(&ctx, &gap).unwrap(),
                DynamicValue::array([
                    DynamicValue::Undefined,
                    DynamicValue::Undefined,
                    DynamicValue::from("x")
                ])
            );
        });
    }

    #[test]
    fn oversized_containers_are_rejected() {
        let bridge = ValueBridge::default().with_max_elements(4);
        with_ctx(|ctx| {
            for source in [
                "[1, 2, 3, 4, 5]",
                "const far = []; far[10] = 1; far",
                "({ a: 1, b: 2, c: 3, d: 4, e: 5 })",
            ] {
                let value: Value = ctx.eval(source).unwrap();
                assert!(
                    matches!(
                        bridge.from_js(&ctx, &value),
                        Err(ConversionError::TooManyElements { limit: 4 })
                    ),
                    "{source} was not rejected"
                );
            }
            let fits: Value = ctx.eval("[1, 2, 3, 4]").unwrap();
            assert_eq!(bridge.from_js(&ctx, &fits).unwrap().len(), 4);
        });
    }

    #[test]
    fn script_objects_convert() {
        let bridge = ValueBridge::default();
        with_ctx(|ctx| {
            let value: Value = ctx
                .eval("({ a: 1, b: [true, null, 'x'], c: undefined, d: new Uint8Array([9, 8]) })")
                .unwrap();
            let converted = bridge.from_js(&ctx, &value).unwrap();
            assert_eq!(converted.get("a"), &DynamicValue::from(1));
            assert_eq!(
                converted.get("b"),
                &DynamicValue::array([
                    DynamicValue::from(true),
                    DynamicValue::Undefined,
                    DynamicValue::from("x")
                ])
            );
            assert!(converted.get("c").is_undefined());
            assert_eq!(converted.len(), 3);
            assert_eq!(converted.get("d"), &DynamicValue::from(vec![9u8, 8]));
        });
    }
}
