//! Deterministic hashing of structured call arguments.
//!
//! Memoized calls are identified by hashing their receiver and arguments. Values are modeled as
//! [`KeyValue`]s, a JSON-like tree whose composite nodes are shared handles. Sharing allows
//! building self-referential graphs, which the hasher handles by remembering the identity of every
//! composite node it descended into and treating a revisited node as already emitted.
//!
//! The emitted stream is independent of object field insertion order, and optionally of array
//! element order (see [`HashConfig::unordered_arrays`]).

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type Shared<T> = Arc<RwLock<T>>;

/// A structured value that can be hashed into a cache key.
#[derive(Clone, Debug, Default)]
pub enum KeyValue {
    /// The absence of a value. Hashes differently from [`KeyValue::Null`].
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// An array whose elements may be appended to after creation.
    Array(Shared<Vec<KeyValue>>),
    /// An object with uniquely named fields.
    Object(Shared<Vec<(String, KeyValue)>>),
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

impl KeyValue {
    pub fn array(items: impl IntoIterator<Item = KeyValue>) -> Self {
        Self::Array(Arc::new(RwLock::new(items.into_iter().collect())))
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, KeyValue)>) -> Self {
        let object = Self::Object(Default::default());
        for (key, value) in fields {
            object.insert(key, value);
        }
        object
    }

    /// Converts any serializable value into its structured representation.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::from)
    }

    /// Appends `value` to this array. Returns `false` if this is not an array.
    pub fn push(&self, value: KeyValue) -> bool {
        match self {
            Self::Array(items) => {
                items
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(value);
                true
            }
            _ => false,
        }
    }

    /// Sets the field `key` of this object, replacing a previous value.
    ///
    /// Returns `false` if this is not an object.
    pub fn insert(&self, key: impl Into<String>, value: KeyValue) -> bool {
        let Self::Object(fields) = self else {
            return false;
        };
        let key = key.into();
        let mut fields = fields.write().unwrap_or_else(PoisonError::into_inner);
        match fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => fields.push((key, value)),
        }
        true
    }

    /// Whether this is an array or object.
    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Array(_) | Self::Object(_))
    }

    /// The type tag used when emitting scalars.
    fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Null | Self::Array(_) | Self::Object(_) => "object",
        }
    }

    /// Renders a scalar as `<type>/<text>`.
    ///
    /// `null` and `undefined` render as just their name. Composites have no scalar
    /// representation and return `None`.
    pub(crate) fn scalar_text(&self) -> Option<String> {
        let text = match self {
            Self::Undefined => return Some("undefined".into()),
            Self::Null => return Some("null".into()),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => s.clone(),
            Self::Array(_) | Self::Object(_) => return None,
        };
        Some(format!("{}/{text}", self.type_name()))
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.into()
    } else if n == 0.0 {
        "0".into()
    } else {
        n.to_string()
    }
}

impl From<serde_json::Value> for KeyValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::array(items.into_iter().map(Self::from)),
            Value::Object(fields) => Self::object(fields.into_iter().map(|(k, v)| (k, v.into()))),
        }
    }
}

impl From<bool> for KeyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

macro_rules! number_conversions {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for KeyValue {
                fn from(value: $ty) -> Self {
                    Self::Number(value as f64)
                }
            }
        )*
    };
}

number_conversions!(i32, i64, u32, u64, usize, f32, f64);

impl<T: Into<KeyValue>> From<Option<T>> for KeyValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// The digest used to turn the emitted stream into a key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// Hex-encoded SHA-256.
    #[default]
    Sha256,
    /// A small non-cryptographic rolling hash.
    Basic,
    /// Hashing is unavailable; every call is treated as not cacheable.
    Disabled,
}

/// Controls how keys are derived.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    pub algorithm: HashAlgorithm,
    /// Treat arrays as multisets, so `[1, 2]` and `[2, 1]` hash the same.
    pub unordered_arrays: bool,
}

/// Turns [`KeyValue`]s into stable strings.
#[derive(Clone, Debug, Default)]
pub struct KeyHasher {
    config: HashConfig,
}

impl KeyHasher {
    pub fn new(config: HashConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HashConfig {
        &self.config
    }

    /// Hashes `value`, or returns `None` if no hash algorithm is available.
    pub fn hash(&self, value: &KeyValue) -> Option<String> {
        let algorithm = self.config.algorithm;
        if algorithm == HashAlgorithm::Disabled {
            return None;
        }
        Some(self.digest(algorithm, value, &mut HashSet::new()))
    }

    fn digest(
        &self,
        algorithm: HashAlgorithm,
        value: &KeyValue,
        visited: &mut HashSet<usize>,
    ) -> String {
        let mut state = HashState::new(algorithm);
        self.emit(algorithm, &mut state, value, visited);
        state.finish()
    }

    fn emit(
        &self,
        algorithm: HashAlgorithm,
        state: &mut HashState,
        value: &KeyValue,
        visited: &mut HashSet<usize>,
    ) {
        match value {
            KeyValue::Array(items) => {
                if !visited.insert(Arc::as_ptr(items) as *const () as usize) {
                    return;
                }
                let items = read(items);
                if self.config.unordered_arrays {
                    // Sub-hashes share the visited set so cycles through arrays terminate.
                    let mut hashes: Vec<_> = items
                        .iter()
                        .map(|item| self.digest(algorithm, item, visited))
                        .collect();
                    hashes.sort();
                    state.update(&format!("array/{}/{}", items.len(), hashes.join(",")));
                } else {
                    for (index, item) in items.iter().enumerate() {
                        state.update(&format!("string/{index}"));
                        self.emit(algorithm, state, item, visited);
                    }
                }
            }
            KeyValue::Object(fields) => {
                if !visited.insert(Arc::as_ptr(fields) as *const () as usize) {
                    return;
                }
                let fields = read(fields);
                let mut sorted: Vec<_> = fields.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                for (key, value) in sorted {
                    state.update(&format!("string/{key}"));
                    self.emit(algorithm, state, value, visited);
                }
            }
            scalar => {
                if let Some(text) = scalar.scalar_text() {
                    state.update(&text);
                }
            }
        }
    }
}

enum HashState {
    Sha256(Sha256),
    Basic(BasicHash),
}

impl HashState {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Basic => Self::Basic(BasicHash::default()),
            _ => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, chunk: &str) {
        match self {
            Self::Sha256(hasher) => hasher.update(chunk.as_bytes()),
            Self::Basic(hasher) => hasher.update(chunk),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
            Self::Basic(hasher) => hasher.codes.concat(),
        }
    }
}

/// Six rolling 32-bit codes, each chunk folded into the next one in turn.
struct BasicHash {
    next: usize,
    codes: [String; 6],
}

impl Default for BasicHash {
    fn default() -> Self {
        Self {
            next: 0,
            codes: std::array::from_fn(|_| "0".to_owned()),
        }
    }
}

impl BasicHash {
    fn update(&mut self, chunk: &str) {
        self.next = (self.next + 1) % self.codes.len();
        let code = &mut self.codes[self.next];
        code.push_str(chunk);
        *code = sub_hash(code);
    }
}

fn sub_hash(text: &str) -> String {
    let mut h: i32 = 0;
    for unit in text.encode_utf16() {
        h = (i64::from(h) * 2333 + i64::from(unit)) as u32 as i32;
    }
    to_base36(h)
}

fn to_base36(value: i32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut magnitude = i64::from(value).unsigned_abs();
    if magnitude == 0 {
        return "0".into();
    }
    let mut digits = Vec::new();
    while magnitude > 0 {
        digits.push(DIGITS[(magnitude % 36) as usize]);
        magnitude /= 36;
    }
    let mut out = String::with_capacity(digits.len() + 1);
    if value < 0 {
        out.push('-');
    }
    out.extend(digits.iter().rev().map(|&d| d as char));
    out
}
