//! Shell quoting of arbitrary byte strings.
//!
//! Words made only of harmless bytes are printed as is. Anything else is
//! wrapped in single quotes, where a single quote becomes `'\''` and a newline
//! becomes `'$'\n''` so that every trace line stays on one physical line.

use std::borrow::Cow;

/// Bytes that force quoting: control characters, space, and everything a
/// POSIX shell or bash gives a meaning to.
const SPECIAL: &[u8] = b"\x01\x02\x03\x04\x05\x06\x07\x08\
    \x09\x0a\x0b\x0c\x0d\x0e\x0f\x10\
    \x11\x12\x13\x14\x15\x16\x17\x18\
    \x19\x1a\x1b\x1c\x1d\x1e\x1f\x20\
    `^#*[]=|\\?${}()'\"<>&;~!\x7f";

pub fn needs_quoting(word: &[u8]) -> bool {
    word.is_empty() || word.iter().any(|b| SPECIAL.contains(b))
}

/// Append the shell-quoted form of `word` to `out`.
pub fn push_quoted(out: &mut Vec<u8>, word: &[u8]) {
    if !needs_quoting(word) {
        out.extend_from_slice(word);
        return;
    }

    out.push(b'\'');
    for &b in word {
        match b {
            b'\'' => out.extend_from_slice(b"'\\''"),
            b'\n' => out.extend_from_slice(b"'$'\\n''"),
            _ => out.push(b),
        }
    }
    out.push(b'\'');
}

pub fn quote(word: &[u8]) -> Cow<'_, [u8]> {
    if !needs_quoting(word) {
        return Cow::Borrowed(word);
    }
    let mut out = Vec::with_capacity(word.len() + 2);
    push_quoted(&mut out, word);
    Cow::Owned(out)
}
