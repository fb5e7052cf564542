//! Filename escaping for archive member names.
//!
//! Collection and resource names are valid database URI segments but may be
//! illegal on common filesystems. Every reserved character is replaced by
//! `&HH;`, where `HH` is its two-digit uppercase hex code.

/// Characters that never appear verbatim in an archive member name.
const RESERVED: [char; 9] = ['"', '&', '*', ':', '<', '>', '?', '\\', '|'];

/// Escape reserved characters in a collection or resource name.
pub fn encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if RESERVED.contains(&c) {
            out.push_str(&format!("&{:02X};", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

/// Reverse [`encode`]. Sequences that are not a valid escape are kept as-is.
pub fn decode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let candidate = &rest[pos..];
        match unescape_at(candidate) {
            Some(c) => {
                out.push(c);
                rest = &candidate[4..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn unescape_at(s: &str) -> Option<char> {
    let bytes = s.as_bytes();
    if bytes.len() < 4 || bytes[3] != b';' {
        return None;
    }
    let hex = std::str::from_utf8(&bytes[1..3]).ok()?;
    let code = u8::from_str_radix(hex, 16).ok()?;
    let c = code as char;
    RESERVED.contains(&c).then_some(c)
}

/// Archive member name for a resource. `.` and `..` cannot be stored as
/// files, so they get a generated name keyed by the resource's position.
pub fn resource_filename(name: &str, index: usize) -> String {
    match name {
        "." => format!("_docdb_generated_backup_filename_dot_file_{}", index),
        ".." => format!("_docdb_generated_backup_filename_dotdot_file_{}", index),
        _ => encode(name),
    }
}
