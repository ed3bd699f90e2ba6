//! Dotted-path access into nested JSON values.
//!
//! Grammar:
//! ```text
//! Path     ::= Part ( '.' Part )*
//! Part     ::= Name ( '[' Integer ']' )*
//! ```
//!
//! A plain numeric part (`items.0`) indexes arrays as well, so `a.b[0].c` and
//! `a.b.0.c` address the same value.

use serde_json::{Map, Value};

use blockrun_types::{BlockrunError, Result};

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    fn as_index(&self) -> Option<usize> {
        match self {
            Segment::Index(i) => Some(*i),
            Segment::Key(k) => k.parse().ok(),
        }
    }

    fn as_key(&self) -> String {
        match self {
            Segment::Key(k) => k.clone(),
            Segment::Index(i) => i.to_string(),
        }
    }
}

/// Split a dotted path into segments. The empty path yields no segments.
pub fn parse_path(path: &str) -> Vec<Segment> {
    if path.is_empty() {
        return Vec::new();
    }
    let mut segments = Vec::new();
    for part in path.split('.') {
        push_part(part, &mut segments);
    }
    segments
}

fn push_part(part: &str, segments: &mut Vec<Segment>) {
    if let Some(open) = part.find('[') {
        if part.ends_with(']') && open + 1 < part.len() {
            let name = &part[..open];
            let inner = &part[open + 1..part.len() - 1];
            let indices: Option<Vec<usize>> =
                inner.split("][").map(|s| s.trim().parse().ok()).collect();
            if let Some(indices) = indices {
                if !name.is_empty() {
                    segments.push(Segment::Key(name.to_string()));
                }
                segments.extend(indices.into_iter().map(Segment::Index));
                return;
            }
        }
    }
    segments.push(Segment::Key(part.to_string()));
}

/// Walk `root` along `path`. Returns `None` when any step is missing or an
/// intermediate value is `null` or a scalar. The empty path returns `root`.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    get_segments(root, &parse_path(path))
}

/// Like [`get_path`] but with pre-parsed segments.
pub fn get_segments<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(&segment.as_key())?,
            Value::Array(items) => items.get(segment.as_index()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Largest array index [`set_path`] will grow an array to reach.
pub const MAX_ARRAY_INDEX: usize = 65_535;

/// Assign `value` at `path`, creating missing intermediates: records for
/// named segments, arrays for bracketed indices. Scalars in the way are
/// replaced. The empty path replaces `root` itself.
///
/// Fails, leaving `root` untouched, when a bracketed index exceeds
/// [`MAX_ARRAY_INDEX`].
pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments = parse_path(path);
    if let Some(index) = segments.iter().find_map(|s| match s {
        Segment::Index(i) if *i > MAX_ARRAY_INDEX => Some(*i),
        _ => None,
    }) {
        return Err(BlockrunError::InvalidPath {
            path: path.to_string(),
            message: format!("index {index} exceeds {MAX_ARRAY_INDEX}"),
        });
    }

    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return Ok(());
    };
    let mut current = root;
    for segment in parents {
        current = slot_mut(current, segment);
    }
    *slot_mut(current, last) = value;
    Ok(())
}

/// Return the child slot for `segment`, converting `current` into a suitable
/// container first when it cannot hold one. A numeric key past
/// [`MAX_ARRAY_INDEX`] does not fit an array and turns it into a record.
fn slot_mut<'a>(current: &'a mut Value, segment: &Segment) -> &'a mut Value {
    let array_index = segment.as_index().filter(|i| *i <= MAX_ARRAY_INDEX);
    let fits = match &*current {
        Value::Object(_) => true,
        Value::Array(_) => array_index.is_some(),
        _ => false,
    };
    if !fits {
        *current = match segment {
            Segment::Index(_) => Value::Array(Vec::new()),
            Segment::Key(_) => Value::Object(Map::new()),
        };
    }
    match current {
        Value::Array(items) => {
            let index = array_index.unwrap_or_default();
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            &mut items[index]
        }
        Value::Object(map) => map.entry(segment.as_key()).or_insert(Value::Null),
        other => other,
    }
}
