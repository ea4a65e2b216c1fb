//! Endpoint template resolution.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use bizsync_common::{BusinessType, Error, Result};

/// Placeholder for the active business vertical.
pub const BUSINESS_TYPE_PLACEHOLDER: &str = "{businessType}";
/// Placeholder for the target entity id.
pub const ID_PLACEHOLDER: &str = ":id";

/// Characters escaped when substituting a value into a single path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Substitute `{businessType}` and `:id` in a path template.
///
/// # Errors
/// - `InvalidInput` if the template needs a business type or id that was not supplied
pub fn resolve_endpoint(
    template: &str,
    business_type: Option<&BusinessType>,
    id: Option<&str>,
) -> Result<String> {
    let mut path = template.to_string();

    if path.contains(BUSINESS_TYPE_PLACEHOLDER) {
        let business_type = business_type.ok_or_else(|| {
            Error::InvalidInput(format!("Endpoint '{}' requires a business type", template))
        })?;
        let encoded = utf8_percent_encode(business_type.as_str(), SEGMENT).to_string();
        path = path.replace(BUSINESS_TYPE_PLACEHOLDER, &encoded);
    }

    if has_id_placeholder(&path) {
        let id = id.ok_or_else(|| {
            Error::InvalidInput(format!("Endpoint '{}' requires an id", template))
        })?;
        let encoded = utf8_percent_encode(id, SEGMENT).to_string();
        path = replace_id(&path, &encoded);
    }

    Ok(path)
}

/// True if `:id` occurs as a whole token (not a prefix of `:identifier`).
fn has_id_placeholder(path: &str) -> bool {
    id_positions(path).next().is_some()
}

fn id_positions(path: &str) -> impl Iterator<Item = usize> + '_ {
    path.match_indices(ID_PLACEHOLDER).filter_map(move |(pos, _)| {
        let next = path[pos + ID_PLACEHOLDER.len()..].chars().next();
        match next {
            Some(c) if c.is_ascii_alphanumeric() || c == '_' => None,
            _ => Some(pos),
        }
    })
}

fn replace_id(path: &str, value: &str) -> String {
    let mut out = String::with_capacity(path.len() + value.len());
    let mut last = 0;
    for pos in id_positions(path) {
        out.push_str(&path[last..pos]);
        out.push_str(value);
        last = pos + ID_PLACEHOLDER.len();
    }
    out.push_str(&path[last..]);
    out
}
